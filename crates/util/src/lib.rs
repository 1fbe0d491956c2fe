pub mod config;

pub use config::{AppConfig, ConfigError, Environment, ScrapeConfig, TwilioConfig, WebhookConfig};
