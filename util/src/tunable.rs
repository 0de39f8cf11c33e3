use config::{Config, ConfigError};
use lazy_static::lazy_static;
use log::*;
use serde::Deserialize;
use std::{fmt::Debug, sync::RwLock};

lazy_static! {
    pub static ref CONFIG: RwLock<Config> = Default::default();
}

/// Look up a named tunable from the loaded config file, falling back to the
/// compiled-in default. Intended to be called once per tunable, from a
/// lazy_static initializer.
pub fn get_tunable<'de, T>(name: &str, default: T) -> T
where
    T: Deserialize<'de> + Debug,
{
    match CONFIG.read().unwrap().get(name) {
        Ok(v) => {
            info!("{}: using value {:?} from config file", name, v);
            v
        }
        Err(ConfigError::NotFound(_)) => default,
        Err(e) => {
            warn!("{}: using default: {:?}", e, default);
            default
        }
    }
}

pub fn read_tunable_config(file_name: &str) {
    let mut config = CONFIG.write().unwrap();
    config.merge(config::File::with_name(file_name)).unwrap();
    info!("config: {}", config.cache);
}
