pub mod commission;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod time;

pub struct Config {
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        use std::env::var;

        Config {
            database_url: var("DATABASE_URL").unwrap(),
        }
    }
}
