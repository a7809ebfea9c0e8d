// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Settings service: a TOML-file backed key-value store with documented
//! defaults for every key. Network bring-up, the UI and thermal management
//! consume these through the same store; the mining core reads its pool and
//! chain parameters here and persists the all-time best difficulty.

use axe_logging::macros::*;

use serde::{Deserialize, Serialize};

use crate::bm13xx;
use crate::error::{Error, Result};

use std::path::PathBuf;
use std::sync::Mutex;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/axeminer.toml";

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Credentials the network collaborator uses; defaults keep the AP mode
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub hostname: String,

    pub stratum_url: String,
    pub stratum_port: u16,
    pub stratum_user: String,
    pub stratum_pass: String,
    pub fallback_stratum_url: String,
    pub fallback_stratum_port: u16,
    pub fallback_stratum_user: String,
    pub fallback_stratum_pass: String,
    /// Difficulty hint sent right after authorization; 0 disables the hint
    pub suggest_difficulty: u64,

    /// One of BM1366, BM1368, BM1370, BM1397
    pub asic_model: String,
    /// Target chip clock in MHz; 0 selects the model default
    pub asic_frequency: u16,
    /// Core voltage in mV (consumed by the power collaborator)
    pub asic_voltage: u16,
    /// Device node of the chain UART
    pub asic_serial: String,
    /// Chips expected on the chain; enumeration logs a mismatch
    pub asic_count: usize,
    /// Alignment/size of the per-job starting nonce subrange
    pub nonce_subrange: u32,

    /// All-time best share difficulty, persisted across restarts
    pub best_difficulty: u64,
    /// Thermal collaborator flag; non-zero halts mining at boot
    pub overheat_mode: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            hostname: "axeminer".to_string(),
            stratum_url: "public-pool.io".to_string(),
            stratum_port: 21496,
            stratum_user: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa.axeminer".to_string(),
            stratum_pass: "x".to_string(),
            fallback_stratum_url: String::new(),
            fallback_stratum_port: 0,
            fallback_stratum_user: String::new(),
            fallback_stratum_pass: String::new(),
            suggest_difficulty: 1000,
            asic_model: "BM1366".to_string(),
            asic_frequency: 0,
            asic_voltage: 1200,
            asic_serial: "/dev/ttyS1".to_string(),
            asic_count: 1,
            nonce_subrange: crate::job::DEFAULT_NONCE_SUBRANGE,
            best_difficulty: 0,
            overheat_mode: 0,
        }
    }
}

impl Settings {
    pub fn model(&self) -> Result<bm13xx::Model> {
        bm13xx::Model::from_name(&self.asic_model)
            .ok_or_else(|| Error::Config(format!("unknown ASIC model '{}'", self.asic_model)))
    }

    /// Requested chip clock, falling back to the model default
    pub fn frequency_mhz(&self) -> Result<f32> {
        Ok(match self.asic_frequency {
            0 => self.model()?.default_frequency_mhz(),
            mhz => mhz as f32,
        })
    }

    pub fn has_fallback_pool(&self) -> bool {
        !self.fallback_stratum_url.is_empty() && self.fallback_stratum_port != 0
    }

    /// Register the command line switches that may override the file
    pub fn add_args<'a, 'b>(app: clap::App<'a, 'b>) -> clap::App<'a, 'b> {
        app.arg(
            clap::Arg::with_name("config")
                .long("config")
                .help("Set config file path")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("pool")
                .short("p")
                .long("pool")
                .value_name("HOSTNAME:PORT")
                .help("Address of the stratum V1 server")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("user")
                .short("u")
                .long("user")
                .value_name("USERNAME.WORKERNAME")
                .help("Specify user and worker name")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("frequency")
                .long("frequency")
                .help("Set chip frequency (in MHz)")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("model")
                .long("model")
                .help("ASIC model on the chain (BM1366/BM1368/BM1370/BM1397)")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("serial")
                .long("serial")
                .help("Device node of the chain UART")
                .required(false)
                .takes_value(true),
        )
    }

    /// Fold command line overrides into the settings
    pub fn apply_args(&mut self, matches: &clap::ArgMatches) -> Result<()> {
        if let Some(pool) = matches.value_of("pool") {
            let mut parts = pool.rsplitn(2, ':');
            let port = parts
                .next()
                .and_then(|port| port.parse::<u16>().ok())
                .ok_or_else(|| Error::Config(format!("invalid pool address '{}'", pool)))?;
            let host = parts
                .next()
                .filter(|host| !host.is_empty())
                .ok_or_else(|| Error::Config(format!("invalid pool address '{}'", pool)))?;
            self.stratum_url = host.to_string();
            self.stratum_port = port;
        }
        if let Some(user) = matches.value_of("user") {
            self.stratum_user = user.to_string();
        }
        if let Some(frequency) = matches.value_of("frequency") {
            self.asic_frequency = frequency
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid frequency '{}'", frequency)))?;
        }
        if let Some(model) = matches.value_of("model") {
            self.asic_model = model.to_string();
            // fail early on typos
            self.model()?;
        }
        if let Some(serial) = matches.value_of("serial") {
            self.asic_serial = serial.to_string();
        }
        Ok(())
    }
}

/// Shared settings store; writers persist back to the TOML file
pub struct Store {
    path: PathBuf,
    settings: Mutex<Settings>,
}

impl Store {
    /// Load from `path`. A missing file is not an error: every key has a
    /// documented default.
    pub fn load(path: &str) -> Result<Self> {
        let settings = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("{}: {}", path, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("config file {} not found, using defaults", path);
                Default::default()
            }
            Err(e) => return Err(Error::Config(format!("{}: {}", path, e))),
        };
        Ok(Self {
            path: path.into(),
            settings: Mutex::new(settings),
        })
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> Settings {
        self.settings.lock().expect("BUG: settings lock").clone()
    }

    pub fn apply<R, F: FnOnce(&mut Settings) -> R>(&self, mutate: F) -> R {
        let mut settings = self.settings.lock().expect("BUG: settings lock");
        mutate(&mut settings)
    }

    /// Record a new all-time best difficulty and write it back to the file.
    /// Persistence failure must never stop the mining pipeline.
    pub fn update_best_difficulty(&self, difficulty: u64) {
        let snapshot = {
            let mut settings = self.settings.lock().expect("BUG: settings lock");
            settings.best_difficulty = difficulty;
            settings.clone()
        };
        if let Err(e) = self.persist(&snapshot) {
            warn!("cannot persist best difficulty: {}", e);
        }
    }

    fn persist(&self, settings: &Settings) -> Result<()> {
        let serialized = toml::to_string(settings)
            .map_err(|e| Error::Config(format!("serialize settings: {}", e)))?;
        std::fs::write(&self.path, serialized)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.asic_model, "BM1366");
        assert_eq!(settings.model().expect("known model"), bm13xx::Model::Bm1366);
        // frequency 0 resolves to the model default clock
        assert_eq!(settings.frequency_mhz().expect("frequency"), 485.0);
        assert_eq!(settings.best_difficulty, 0);
        assert!(!settings.has_fallback_pool());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings: Settings =
            toml::from_str("stratum_url = \"solo.ckpool.org\"\nstratum_port = 3333\n")
                .expect("parse");
        assert_eq!(settings.stratum_url, "solo.ckpool.org");
        assert_eq!(settings.stratum_port, 3333);
        // untouched keys fall back to their defaults
        assert_eq!(settings.hostname, "axeminer");
        assert_eq!(settings.asic_serial, "/dev/ttyS1");
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<Settings>("no_such_key = 1\n").is_err());
    }

    #[test]
    fn test_apply_pool_argument() {
        let app = Settings::add_args(clap::App::new("test"));
        let matches = app
            .get_matches_from_safe(vec!["test", "--pool", "stratum.example.com:3333"])
            .expect("parse args");
        let mut settings = Settings::default();
        settings.apply_args(&matches).expect("apply");
        assert_eq!(settings.stratum_url, "stratum.example.com");
        assert_eq!(settings.stratum_port, 3333);
    }

    #[test]
    fn test_apply_bad_pool_argument() {
        let app = Settings::add_args(clap::App::new("test"));
        let matches = app
            .get_matches_from_safe(vec!["test", "--pool", "no-port-here"])
            .expect("parse args");
        let mut settings = Settings::default();
        assert!(settings.apply_args(&matches).is_err());
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        let mut settings = Settings::default();
        settings.asic_model = "BM9999".to_string();
        assert!(settings.model().is_err());
    }
}
