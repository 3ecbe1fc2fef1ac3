pub mod ids;
pub mod messages;

pub use ids::*;
pub use messages::*;
