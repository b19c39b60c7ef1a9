pub mod models;
pub mod rate_limit;
pub mod traits;

pub use models::*;
pub use rate_limit::*;
pub use traits::*;
