pub mod errors;
pub mod models;
pub mod relay;

pub use errors::*;
pub use models::*;
pub use relay::{relay, Transfer};
