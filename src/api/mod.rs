//! HTTP surface over the request pipeline and the task manager.

mod error;
pub mod models;
mod server;
pub mod services;
pub mod state;
pub(crate) mod utils;
mod validation;

pub use error::ApiError;
pub use server::{router, run};
pub use state::AppState;
pub use utils::USER_HEADER;
