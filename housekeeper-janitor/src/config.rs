use std::time::Duration;

use envconfig::Envconfig;
use housekeeper_common::scheduler::SchedulerConfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "1")]
    pub tick_interval_secs: u64,

    #[envconfig(default = "60")]
    pub job_timeout_secs: u64,

    #[envconfig(default = "30")]
    pub drain_timeout_secs: u64,

    #[envconfig(default = "100")]
    pub sample_retention: usize,

    #[envconfig(default = "/tmp/housekeeper")]
    pub scratch_dir: String,

    #[envconfig(default = "300")]
    pub scratch_sweep_interval_secs: u64,

    #[envconfig(default = "3600")]
    pub scratch_max_age_secs: u64,

    #[envconfig(default = "60")]
    pub heartbeat_interval_secs: u64,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL the lifecycle commands use to reach a running janitor on this host.
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.tick_interval_secs),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            sample_retention: self.sample_retention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.local_url(), "http://127.0.0.1:3302");
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.tick_interval, Duration::from_secs(1));
        assert_eq!(scheduler.job_timeout, Duration::from_secs(60));
        assert_eq!(scheduler.drain_timeout, Duration::from_secs(30));
        assert_eq!(scheduler.sample_retention, 100);
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            ("BIND_PORT".to_owned(), "8080".to_owned()),
            ("SAMPLE_RETENTION".to_owned(), "10".to_owned()),
            ("SCRATCH_MAX_AGE_SECS".to_owned(), "5".to_owned()),
        ]);

        let config = Config::init_from_hashmap(&vars).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.scheduler_config().sample_retention, 10);
        assert_eq!(config.scratch_max_age_secs, 5);
    }
}
