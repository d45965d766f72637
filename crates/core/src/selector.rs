//! Equality-based label selectors (`app=web,tier!=db,canary,!legacy`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::Resource;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|l| l.get(k));
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v),
            Requirement::NotEquals(k, v) => get(k) != Some(v),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::DoesNotExist(k) => get(k).is_none(),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selector {
    reqs: SmallVec<[Requirement; 4]>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, req: Requirement) -> Self {
        self.reqs.push(req);
        self
    }

    pub fn selects_all(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn matches_labels(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }

    pub fn matches<K: Resource>(&self, obj: &K) -> bool {
        self.matches_labels(obj.meta().labels.as_ref())
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut sel = Selector::everything();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(label_key(k)?, v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                Requirement::Equals(label_key(k)?, v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::DoesNotExist(label_key(k)?)
            } else {
                Requirement::Exists(label_key(term)?)
            };
            sel.reqs.push(req);
        }
        Ok(sel)
    }
}

fn label_key(k: &str) -> Result<String, Error> {
    let k = k.trim();
    if k.is_empty() || k.contains(char::is_whitespace) {
        return Err(Error::Config(format!("invalid label key {:?}", k)));
    }
    Ok(k.to_string())
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .reqs
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{}={}", k, v),
                Requirement::NotEquals(k, v) => format!("{}!={}", k, v),
                Requirement::Exists(k) => k.clone(),
                Requirement::DoesNotExist(k) => format!("!{}", k),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}
