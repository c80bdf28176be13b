use crate::config;

/// Print the platform directories this process resolved (honoring `--basepath`) and exit.
pub fn info() {
    println!("CONFIG_PATH {}", config::config_dir().display());
    println!("DATA_PATH {}", config::data_dir().display());
    println!("CACHE_PATH {}", config::cache_dir().display());
}
