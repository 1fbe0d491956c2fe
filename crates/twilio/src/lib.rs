pub mod client;

pub use client::{TwilioClient, TwilioError};
