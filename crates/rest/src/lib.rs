//! REST side of the ferrule client.
//!
//! [`Dispatcher`] owns the HTTP client and feeds every request through the
//! shared [`ferrule_ratelimit::RateLimit`] store.

pub mod dispatcher;
pub mod error;
pub mod headers;
pub mod routes;

pub use {
    dispatcher::{Dispatcher, RestResponse},
    error::{Error, Result},
    routes::{CreateMessage, CurrentUser, InteractionResponse, Message},
};
