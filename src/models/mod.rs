pub mod audit;
pub mod enums;
pub mod item;
pub mod mapping;
pub mod reference;
pub mod review;
pub mod session;

pub use audit::*;
pub use enums::*;
pub use item::*;
pub use mapping::*;
pub use reference::*;
pub use review::*;
pub use session::*;
