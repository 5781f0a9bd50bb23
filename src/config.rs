use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{SodaError, SodaResult};
use crate::keys::KEY_HASH_LEN;
use crate::workload::RunCounters;

pub const DEFAULT_PORT: u16 = 11211;
pub const DEFAULT_VBUCKETS: u32 = 1024;
pub const DEFAULT_MAX_ITEMS: i64 = 100_000;
/// Batch size used whenever `max-ops-per-sec` is set.
pub const THROTTLED_BATCH: usize = 10;
/// Longest key memcached accepts.
pub const MAX_KEY_LEN: usize = 250;

/// Every accepted `key=value` parameter: name, default, description.
pub const PARAMS: &[(&str, &str, &str)] = &[
    ("prefix", "", "Prefix for every item key."),
    ("max-ops", "0", "Max number of ops before exiting. 0 means keep going."),
    ("max-items", "-1", "Max number of items; default 100000."),
    ("max-creates", "-1", "Max number of creates; defaults to max-items."),
    ("min-value-size", "10", "Minimal value size (bytes) during SET's; comma-separated."),
    ("ratio-sets", "0.1", "Fraction of requests that should be SET's."),
    ("ratio-creates", "0.1", "Fraction of SET's that should create new items."),
    ("ratio-misses", "0.05", "Fraction of GET's that should miss."),
    ("ratio-hot", "0.2", "Fraction of items to have as a hot item subset."),
    ("ratio-hot-sets", "0.95", "Fraction of SET's that hit the hot item subset."),
    ("ratio-hot-gets", "0.95", "Fraction of GET's that hit the hot item subset."),
    ("ratio-deletes", "0.0", "Fraction of SET updates that should be DELETE's instead."),
    ("ratio-arpas", "0.0", "Fraction of SET non-DELETE's to be 'a-r-p-a' cmds."),
    ("expiration", "0", "Expiration time parameter for SET's."),
    ("exit-after-creates", "0", "Exit after max-creates is reached."),
    ("threads", "1", "Number of client worker threads to use."),
    ("batch", "100", "Batch / pipeline up this number of commands."),
    ("json", "1", "Use JSON documents. 0 to generate binary documents."),
    ("time", "0", "Stop after this many seconds if > 0."),
    ("max-ops-per-sec", "0", "Max ops/second, which overrides the batch parameter."),
    ("vbuckets", "1024", "Number of partitions used for routing ids (power of two)."),
    ("cur-items", "0", "Number of items known to already exist."),
    ("cur-sets", "0", "Number of sets already done."),
    ("cur-creates", "0", "Number of sets that were creates."),
    ("cur-gets", "0", "Number of gets already done."),
    ("cur-deletes", "0", "Number of deletes already done."),
    ("cur-arpas", "0", "Number of add/replace/prepend/append's (a-r-p-a) commands."),
    ("cur-misses", "0", "Number of gets that were aimed at missing keys."),
];

/// Run configuration. Read-only once a run starts.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct WorkloadConfig {
    pub prefix: String,
    pub max_ops: u64,
    pub max_items: i64,
    pub max_creates: i64,
    pub min_value_size: Vec<usize>,
    pub ratio_sets: f64,
    pub ratio_creates: f64,
    pub ratio_misses: f64,
    pub ratio_hot: f64,
    pub ratio_hot_sets: f64,
    pub ratio_hot_gets: f64,
    pub ratio_deletes: f64,
    pub ratio_arpas: f64,
    pub expiration: u32,
    pub exit_after_creates: bool,
    pub threads: usize,
    pub batch: usize,
    pub json: bool,
    pub time: f64,
    pub max_ops_per_sec: u64,
    pub vbuckets: u32,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            max_ops: 0,
            max_items: -1,
            max_creates: -1,
            min_value_size: vec![10],
            ratio_sets: 0.1,
            ratio_creates: 0.1,
            ratio_misses: 0.05,
            ratio_hot: 0.2,
            ratio_hot_sets: 0.95,
            ratio_hot_gets: 0.95,
            ratio_deletes: 0.0,
            ratio_arpas: 0.0,
            expiration: 0,
            exit_after_creates: false,
            threads: 1,
            batch: 100,
            json: true,
            time: 0.0,
            max_ops_per_sec: 0,
            vbuckets: DEFAULT_VBUCKETS,
        }
    }
}

impl WorkloadConfig {
    /// Pipeline depth actually used by the clients.
    pub fn effective_batch(&self) -> usize {
        if self.max_ops_per_sec > 0 {
            THROTTLED_BATCH
        } else {
            self.batch
        }
    }

    pub fn run_time(&self) -> Option<Duration> {
        if self.time > 0.0 {
            Duration::try_from_secs_f64(self.time).ok()
        } else {
            None
        }
    }

    /// Fills in negative `max-items` / `max-creates` from each other.
    pub fn resolve_limits(&mut self) {
        if self.max_items < 0 && self.max_creates < 0 {
            self.max_items = DEFAULT_MAX_ITEMS;
        }
        if self.max_items < 0 {
            self.max_items = self.max_creates;
        }
        if self.max_creates < 0 {
            self.max_creates = self.max_items;
        }
    }
}

/// Accumulates `key=value` settings from files and the command line, then
/// validates them in one go.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: WorkloadConfig,
    counters: RunCounters,
    errors: BTreeSet<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one `key=value` token. Bad tokens are remembered, not returned.
    pub fn apply_token(&mut self, token: &str) -> &mut Self {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                if self.set(key, value).is_none() {
                    self.errors.insert(token.to_string());
                }
            }
            _ => {
                self.errors.insert(token.to_string());
            }
        }
        self
    }

    pub fn apply_tokens<I, S>(&mut self, tokens: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for token in tokens {
            self.apply_token(token.as_ref());
        }
        self
    }

    /// Applies a flat TOML table whose keys are parameter names.
    pub fn apply_toml_file(&mut self, path: &Path) -> SodaResult<&mut Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            SodaError::config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        self.apply_toml_str(&data)
    }

    pub fn apply_toml_str(&mut self, data: &str) -> SodaResult<&mut Self> {
        let table: toml::Table = data
            .parse()
            .map_err(|e| SodaError::config(format!("invalid TOML config: {}", e)))?;
        for (key, value) in table {
            match toml_value_to_param(&value) {
                Some(text) => {
                    self.apply_token(&format!("{}={}", key, text));
                }
                None => {
                    self.errors.insert(format!("{}={}", key, value));
                }
            }
        }
        Ok(self)
    }

    pub fn build(self) -> SodaResult<(WorkloadConfig, RunCounters)> {
        let mut errors: Vec<String> = self
            .errors
            .into_iter()
            .map(|token| format!("problem parsing key=val option: {}", token))
            .collect();

        let mut config = self.config;
        if config.threads == 0 {
            errors.push("threads must be at least 1".to_string());
        }
        if config.batch == 0 {
            errors.push("batch must be at least 1".to_string());
        }
        if config.vbuckets == 0 || !config.vbuckets.is_power_of_two() {
            errors.push(format!("vbuckets must be a power of two, got {}", config.vbuckets));
        }
        if config.min_value_size.is_empty() {
            errors.push("min-value-size needs at least one size".to_string());
        }
        if Duration::try_from_secs_f64(config.time).is_err() {
            errors.push(format!("time is out of range: {}", config.time));
        }
        if config.prefix.len() + 1 + KEY_HASH_LEN > MAX_KEY_LEN {
            errors.push(format!(
                "prefix is {} bytes, keys would exceed {} bytes",
                config.prefix.len(),
                MAX_KEY_LEN
            ));
        }

        if !errors.is_empty() {
            return Err(SodaError::Config(errors));
        }

        config.resolve_limits();
        Ok((config, self.counters))
    }

    fn set(&mut self, key: &str, value: &str) -> Option<()> {
        let value = match value {
            "y" => "1",
            "n" => "0",
            other => other,
        };
        let c = &mut self.config;
        match key {
            "prefix" => c.prefix = value.to_string(),
            "max-ops" => c.max_ops = parse_count(value)?,
            "max-items" => c.max_items = parse_int(value)?,
            "max-creates" => c.max_creates = parse_int(value)?,
            "min-value-size" => c.min_value_size = parse_sizes(value)?,
            "ratio-sets" => c.ratio_sets = parse_ratio(value)?,
            "ratio-creates" => c.ratio_creates = parse_ratio(value)?,
            "ratio-misses" => c.ratio_misses = parse_ratio(value)?,
            "ratio-hot" => c.ratio_hot = parse_ratio(value)?,
            "ratio-hot-sets" => c.ratio_hot_sets = parse_ratio(value)?,
            "ratio-hot-gets" => c.ratio_hot_gets = parse_ratio(value)?,
            "ratio-deletes" => c.ratio_deletes = parse_ratio(value)?,
            "ratio-arpas" => c.ratio_arpas = parse_ratio(value)?,
            "expiration" => c.expiration = u32::try_from(parse_count(value)?).ok()?,
            "exit-after-creates" => c.exit_after_creates = parse_int(value)? > 0,
            "threads" => c.threads = parse_count(value)? as usize,
            "batch" => c.batch = parse_count(value)? as usize,
            "json" => c.json = parse_int(value)? > 0,
            "time" => c.time = parse_ratio(value).filter(|t| *t >= 0.0)?,
            "max-ops-per-sec" => c.max_ops_per_sec = parse_count(value)?,
            "vbuckets" => c.vbuckets = u32::try_from(parse_count(value)?).ok()?,
            _ => return self.set_counter(key, value),
        }
        Some(())
    }

    fn set_counter(&mut self, key: &str, value: &str) -> Option<()> {
        let n = parse_count(value)?;
        let cur = &mut self.counters;
        match key {
            "cur-items" => cur.items = n,
            "cur-sets" => cur.sets = n,
            "cur-creates" => cur.creates = n,
            "cur-gets" => cur.gets = n,
            "cur-deletes" => cur.deletes = n,
            "cur-arpas" => cur.arpas = n,
            "cur-misses" => cur.misses = n,
            _ => return None,
        }
        Some(())
    }
}

/// Parses a complete parameter list in one call.
pub fn parse_params<I, S>(tokens: I) -> SodaResult<(WorkloadConfig, RunCounters)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut builder = ConfigBuilder::new();
    builder.apply_tokens(tokens);
    builder.build()
}

fn parse_int(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

fn parse_count(value: &str) -> Option<u64> {
    parse_int(value).and_then(|n| u64::try_from(n).ok())
}

fn parse_ratio(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_sizes(value: &str) -> Option<Vec<usize>> {
    value
        .split(',')
        .map(|part| parse_count(part.trim()).map(|n| n as usize))
        .collect()
}

fn toml_value_to_param(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(if *b { "1" } else { "0" }.to_string()),
        toml::Value::Array(items) => items
            .iter()
            .map(toml_value_to_param)
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.join(",")),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// memcached binary protocol with pipelining
    Binary,
    /// memcached text protocol
    Ascii,
    /// logs operations instead of sending them
    Log,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Binary => write!(f, "memcached-binary"),
            Protocol::Ascii => write!(f, "memcached-ascii"),
            Protocol::Log => write!(f, "log"),
        }
    }
}

/// `[protocol://][user[:pass]@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub protocol: Protocol,
    pub user: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn parse(spec: &str) -> SodaResult<Self> {
        let (scheme, rest) = match spec.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("memcached", spec),
        };
        let protocol = match scheme {
            "memcached" | "memcached-binary" => Protocol::Binary,
            "memcached-ascii" => Protocol::Ascii,
            "log" => Protocol::Log,
            other => {
                return Err(SodaError::config(format!("unsupported protocol: {}", other)));
            }
        };

        let (credentials, host_port) = match rest.rsplit_once('@') {
            Some((credentials, host_port)) => (Some(credentials), host_port),
            None => (None, rest),
        };
        let (user, password) = match credentials {
            Some(c) => match c.split_once(':') {
                Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
                None => (Some(c.to_string()), None),
            },
            None => (None, None),
        };
        let user = user.filter(|u| !u.is_empty());

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| SodaError::config(format!("invalid port in target: {}", spec)))?;
                (host, port)
            }
            None => (host_port, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(SodaError::config(format!("missing host in target: {}", spec)));
        }

        Ok(Self {
            protocol,
            user,
            password,
            host: host.to_string(),
            port,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}
