//! Operation mix decisions.
//!
//! The model never draws random numbers. Each decision compares a configured
//! ratio with the ratio observed so far in the run counters, so the realised
//! mix converges on the configuration and a given counter trajectory always
//! produces the same operations.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::WorkloadConfig;
use crate::document::DocumentSynthesizer;
use crate::keys::{key_for, MISS_KEY_ID};

/// Running totals that drive the decisions. Incremented when an operation is
/// chosen, not when it completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    #[serde(rename = "cur-items")]
    pub items: u64,
    #[serde(rename = "cur-sets")]
    pub sets: u64,
    #[serde(rename = "cur-creates")]
    pub creates: u64,
    #[serde(rename = "cur-gets")]
    pub gets: u64,
    #[serde(rename = "cur-deletes")]
    pub deletes: u64,
    #[serde(rename = "cur-arpas")]
    pub arpas: u64,
    #[serde(rename = "cur-misses")]
    pub misses: u64,
}

impl RunCounters {
    pub fn num_ops(&self) -> u64 {
        self.gets + self.sets
    }

    /// Name/value pairs in report order.
    pub fn entries(&self) -> [(&'static str, u64); 7] {
        [
            ("cur-arpas", self.arpas),
            ("cur-creates", self.creates),
            ("cur-deletes", self.deletes),
            ("cur-gets", self.gets),
            ("cur-items", self.items),
            ("cur-misses", self.misses),
            ("cur-sets", self.sets),
        ]
    }
}

/// Add/replace/append/prepend, rotated by the set counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArpaVerb {
    Add,
    Replace,
    Append,
    Prepend,
}

impl ArpaVerb {
    const ROTATION: [ArpaVerb; 4] = [
        ArpaVerb::Add,
        ArpaVerb::Replace,
        ArpaVerb::Append,
        ArpaVerb::Prepend,
    ];

    pub fn from_set_count(sets: u64) -> Self {
        Self::ROTATION[(sets % Self::ROTATION.len() as u64) as usize]
    }

    /// Append and prepend carry no flags/expiration.
    pub fn has_extras(&self) -> bool {
        matches!(self, ArpaVerb::Add | ArpaVerb::Replace)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ArpaVerb::Add => "add",
            ArpaVerb::Replace => "replace",
            ArpaVerb::Append => "append",
            ArpaVerb::Prepend => "prepend",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    Set,
    Delete,
    Arpa(ArpaVerb),
}

impl OpKind {
    /// Stats bucket name: `get`, `set`, `delete` or `arpa`.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Get => "get",
            OpKind::Set => "set",
            OpKind::Delete => "delete",
            OpKind::Arpa(_) => "arpa",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Arpa(verb) => write!(f, "{}", verb.name()),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// What to do next, before the key and payload are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub kind: OpKind,
    pub key_id: i64,
    pub size_class: usize,
    pub create: bool,
}

/// One operation handed to a protocol client.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OpKind,
    pub key_id: i64,
    pub key: String,
    pub payload: Option<String>,
}

impl Operation {
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().map(str::as_bytes).unwrap_or(&[])
    }
}

#[derive(Debug, Clone)]
pub struct WorkloadModel {
    config: Arc<WorkloadConfig>,
    docs: DocumentSynthesizer,
}

impl WorkloadModel {
    pub fn new(config: Arc<WorkloadConfig>) -> Self {
        let docs = DocumentSynthesizer::new(&config.min_value_size, config.json);
        Self { config, docs }
    }

    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    /// True once a configured ceiling has been reached.
    pub fn should_stop(&self, cur: &RunCounters) -> bool {
        let cfg = &self.config;
        if cfg.max_ops > 0 && cfg.max_ops <= cur.num_ops() {
            return true;
        }
        cfg.exit_after_creates && cfg.max_creates > 0 && cfg.max_creates as u64 <= cur.creates
    }

    /// Picks the next operation and bumps the counters that record it.
    pub fn decide(&self, cur: &mut RunCounters) -> Decision {
        let cfg = &self.config;
        let num_ops = cur.num_ops();
        let size_class = choose_entry(&cfg.min_value_size, num_ops);

        let do_set = cfg.ratio_sets > cur.sets as f64 / positive(num_ops) as f64;
        if !do_set {
            cur.gets += 1;
            let do_hit = cfg.ratio_misses * 100.0 < (cur.gets % 100) as f64;
            if !do_hit {
                cur.misses += 1;
                return Decision {
                    kind: OpKind::Get,
                    key_id: MISS_KEY_ID,
                    size_class,
                    create: false,
                };
            }
            let key_id = choose_key_id(cur.items, cfg.ratio_hot, cfg.ratio_hot_gets, cur.gets);
            return Decision {
                kind: OpKind::Get,
                key_id,
                size_class,
                create: false,
            };
        }

        cur.sets += 1;
        let do_create = cfg.max_items > cur.items as i64
            && cfg.max_creates > cur.creates as i64
            && cfg.ratio_creates > cur.creates as f64 / positive(cur.sets) as f64;
        if do_create {
            let key_id = cur.items as i64;
            cur.items += 1;
            cur.creates += 1;
            return Decision {
                kind: OpKind::Set,
                key_id,
                size_class,
                create: true,
            };
        }

        let num_updates = cur.sets.saturating_sub(cur.creates);
        let kind = if cfg.ratio_deletes > cur.deletes as f64 / positive(num_updates) as f64 {
            cur.deletes += 1;
            OpKind::Delete
        } else {
            let num_mutates = num_updates.saturating_sub(cur.deletes);
            if cfg.ratio_arpas > cur.arpas as f64 / positive(num_mutates) as f64 {
                cur.arpas += 1;
                OpKind::Arpa(ArpaVerb::from_set_count(cur.sets))
            } else {
                OpKind::Set
            }
        };

        let key_id = choose_key_id(cur.items, cfg.ratio_hot, cfg.ratio_hot_sets, cur.sets);
        Decision {
            kind,
            key_id,
            size_class,
            create: false,
        }
    }

    /// Builds the wire key and, for stores, the document payload.
    pub fn materialize(&self, decision: &Decision) -> Operation {
        let key = key_for(decision.key_id, &self.config.prefix);
        let payload = match decision.kind {
            OpKind::Set | OpKind::Arpa(_) => {
                Some(self.docs.synthesize(decision.key_id, &key, decision.size_class))
            }
            OpKind::Get | OpKind::Delete => None,
        };
        Operation {
            kind: decision.kind,
            key_id: decision.key_id,
            key,
            payload,
        }
    }

    pub fn next(&self, cur: &mut RunCounters) -> Operation {
        let decision = self.decide(cur);
        self.materialize(&decision)
    }
}

/// Chooses an id from the hot subset `[0, ratio_hot * items)` or the cold
/// remainder. The hot/cold split compares `ratio_hot_choice * 100` with
/// `num_ops % 100`; the offset inside the range is `num_ops % range`.
pub fn choose_key_id(num_items: u64, ratio_hot: f64, ratio_hot_choice: f64, num_ops: u64) -> i64 {
    let hot_end = (ratio_hot * num_items as f64).floor().max(0.0) as u64;
    let (base, range) = if ratio_hot_choice * 100.0 > (num_ops % 100) as f64 {
        (0, hot_end)
    } else {
        let cold = ((1.0 - ratio_hot) * num_items as f64).floor().max(0.0) as u64;
        (hot_end, cold)
    };
    (base + num_ops % positive(range)) as i64
}

fn choose_entry(sizes: &[usize], n: u64) -> usize {
    if sizes.is_empty() {
        return 0;
    }
    sizes[(n % sizes.len() as u64) as usize]
}

fn positive(x: u64) -> u64 {
    x.max(1)
}
