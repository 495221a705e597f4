use crate::Cycle;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A configuration error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{section}: {message}")]
    Invalid { section: String, message: String },
    #[error("{section}: a directory must be inclusive")]
    DirectoryNotInclusive { section: String },
    #[error("{section}: just_directory requires inclusive, directory and allocate_miss and cannot be a victim cache")]
    JustDirectory { section: String },
    #[error("{section}: mega line prefetch requires allocate_miss")]
    MegaWithoutAllocateMiss { section: String },
    #[error("unknown section {section:?} referenced by {by:?}")]
    UnknownSection { section: String, by: String },
    #[error("invalid device {spec:?}: expected \"<section> <name> [shared|sharedby N]\"")]
    InvalidDevice { spec: String },
    #[error("instance name {name:?} is produced by sections {first:?} and {second:?}")]
    NameClash {
        name: String,
        first: String,
        second: String,
    },
    #[error("{name} is its own lower level")]
    Cycle { name: String },
    #[error("{name} has no lower level")]
    MissingLowerLevel { name: String },
    #[error("no first level devices configured")]
    NoFirstLevel,
    #[error("{name} is shared by {caches} coherent caches but cannot keep them coherent with each other")]
    SharedBus { name: String, caches: usize },
}

/// All errors found while validating a configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{} configuration error(s):\n  {}", .0.len(), .0.iter().join("\n  "))]
pub struct Errors(pub Vec<Error>);

impl From<Error> for Errors {
    fn from(err: Error) -> Self {
        Self(vec![err])
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Memory hierarchy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_cores")]
    pub cores: usize,
    /// Devices each core talks to, as `<section> <name> [shared|sharedby N]`.
    pub first_level: Vec<String>,
    pub sections: IndexMap<String, Section>,
}

fn default_cores() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Section {
    Cache(Cache),
    Bus(Bus),
    Memory(Memory),
    Dummy,
}

impl Section {
    /// Device spec of the level below, if any.
    #[must_use]
    pub fn lower_level(&self) -> Option<&str> {
        match self {
            Self::Cache(cache) => Some(cache.lower_level.as_str()),
            Self::Bus(bus) => Some(bus.lower_level.as_str()),
            Self::Memory(_) | Self::Dummy => None,
        }
        .filter(|spec| !spec.trim().is_empty())
    }
}

/// Coherent cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Cache {
    pub size: usize,
    pub assoc: usize,
    pub line_size: usize,

    /// Hit latency.
    pub delay: Cycle,
    /// Tag latency of a miss.
    pub miss_delay: Cycle,
    pub nc_miss_delay: Option<Cycle>,

    pub port_num: usize,
    pub port_occ: Cycle,
    pub port_banks: usize,
    pub send_port_num: usize,
    pub send_port_occ: Cycle,
    pub bank_shift: Option<u32>,
    pub fill_line_size: Option<usize>,

    pub max_requests: usize,
    pub max_prefetch: usize,
    pub drop_prefetch: bool,

    pub inclusive: bool,
    pub directory: bool,
    pub victim: bool,
    pub just_directory: bool,
    pub allocate_miss: bool,
    pub coherent: bool,

    pub nlp_degree: usize,
    pub nlp_distance: u64,
    pub nlp_stride: u64,
    pub prefetch_degree: u32,
    pub mega_lines1k: usize,

    pub lower_level: String,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            size: 32 * 1024,
            assoc: 4,
            line_size: 64,
            delay: 1,
            miss_delay: 1,
            nc_miss_delay: None,
            port_num: 1,
            port_occ: 1,
            port_banks: 1,
            send_port_num: 1,
            send_port_occ: 1,
            bank_shift: None,
            fill_line_size: None,
            max_requests: 32,
            max_prefetch: 32,
            drop_prefetch: true,
            inclusive: true,
            directory: false,
            victim: false,
            just_directory: false,
            allocate_miss: true,
            coherent: true,
            nlp_degree: 0,
            nlp_distance: 0,
            nlp_stride: 1,
            prefetch_degree: 0,
            mega_lines1k: 0,
            lower_level: String::new(),
        }
    }
}

impl std::fmt::Display for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let size = human_bytes::human_bytes(self.size as f64);
        write!(
            f,
            "{size} ({} set, {}-way, {} byte line)",
            self.num_sets(),
            self.assoc,
            self.line_size
        )
    }
}

impl Cache {
    #[inline]
    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.size / (self.assoc * self.line_size).max(1)
    }

    /// Whether the mega-line prefetcher can trigger.
    #[must_use]
    pub fn mega_enabled(&self) -> bool {
        let ratio = (self.line_size * self.mega_lines1k) as f64 / 1024.0;
        ratio > 0.0 && ratio <= 1.0
    }

    fn validate(&self, section: &str, errors: &mut Vec<Error>) {
        let mut invalid = |message: String| {
            errors.push(Error::Invalid {
                section: section.to_string(),
                message,
            });
        };
        if !self.line_size.is_power_of_two() || self.line_size >= 4096 {
            invalid(format!("line size {} must be a power of two below 4096", self.line_size));
        }
        if self.assoc == 0 || self.size == 0 || self.size % (self.assoc * self.line_size).max(1) != 0
        {
            invalid(format!(
                "size {} is not a multiple of {} ways of {} byte lines",
                self.size, self.assoc, self.line_size
            ));
        }
        if !(1..=1024).contains(&self.delay) || !(1..=1024).contains(&self.miss_delay) {
            invalid("delay and miss_delay must be within 1..=1024".to_string());
        }
        if self.miss_delay > self.delay {
            invalid(format!(
                "miss_delay {} exceeds delay {}",
                self.miss_delay, self.delay
            ));
        }
        if !self.port_banks.is_power_of_two() || self.port_banks > 1024 {
            invalid(format!("{} banks is not a power of two", self.port_banks));
        }
        if let Some(fill) = self.fill_line_size {
            if !fill.is_power_of_two() || fill > self.line_size {
                invalid(format!("fill line size {fill} must be a power of two up to the line size"));
            }
        }
        if !(1..=4096).contains(&self.max_requests) {
            invalid(format!("max_requests {} must be within 1..=4096", self.max_requests));
        }
        if self.nlp_degree > 16 || !(1..=1024).contains(&self.nlp_stride) {
            invalid("nlp_degree must be at most 16 and nlp_stride within 1..=1024".to_string());
        }
        if self.prefetch_degree > 32 || self.mega_lines1k > 32 {
            invalid("prefetch_degree and mega_lines1k must be at most 32".to_string());
        }

        if self.directory && !self.inclusive {
            errors.push(Error::DirectoryNotInclusive {
                section: section.to_string(),
            });
        }
        if self.just_directory
            && (!self.inclusive || !self.directory || !self.allocate_miss || self.victim)
        {
            errors.push(Error::JustDirectory {
                section: section.to_string(),
            });
        }
        if !self.allocate_miss && self.mega_enabled() {
            errors.push(Error::MegaWithoutAllocateMiss {
                section: section.to_string(),
            });
        }
    }
}

/// Bus configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Bus {
    pub delay: Cycle,
    pub port_num: usize,
    pub port_occ: Cycle,
    pub lower_level: String,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            delay: 1,
            port_num: 1,
            port_occ: 1,
            lower_level: String::new(),
        }
    }
}

/// Fixed latency memory configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Memory {
    pub delay: Cycle,
    pub line_size: usize,
    /// When disabled, the first access to a line completes after one cycle.
    pub cold_misses: bool,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            delay: 100,
            line_size: 64,
            cold_misses: true,
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, ParseError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ParseError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Checks every section, collecting all errors.
    pub fn validate(&self) -> Result<(), Errors> {
        let mut errors = Vec::new();
        if self.cores == 0 {
            errors.push(Error::Invalid {
                section: "cores".to_string(),
                message: "at least one core is required".to_string(),
            });
        }
        if self.first_level.is_empty() {
            errors.push(Error::NoFirstLevel);
        }
        for (name, section) in &self.sections {
            match section {
                Section::Cache(cache) => cache.validate(name, &mut errors),
                Section::Memory(memory) if !memory.line_size.is_power_of_two() => {
                    errors.push(Error::Invalid {
                        section: name.clone(),
                        message: format!("line size {} must be a power of two", memory.line_size),
                    });
                }
                Section::Bus(_) | Section::Memory(_) | Section::Dummy => {}
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Errors(errors))
        }
    }
}
