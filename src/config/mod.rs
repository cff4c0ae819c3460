mod settings;

pub use settings::{
    Command, Config, Settings, MAX_INTERVAL_SECS, MAX_THRESHOLD_USD, MIN_INTERVAL_SECS,
};
