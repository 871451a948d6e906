use crate::core::{Result, RouterError};
use crate::shard::{KeyRule, ShardRegistry};
use regex::Regex;

/// Java-style `String.hashCode`: `h = h * 31 + unit` over UTF-16 code units
/// with 32-bit wrapping.
///
/// Existing data is placed by this exact function; changing it relocates
/// keys.
pub fn rolling_hash(key: &str) -> i32 {
    key.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Index of the shard a key hashes to among `shard_count` shards.
pub fn hash_index(key: &str, shard_count: usize) -> Option<usize> {
    if shard_count == 0 {
        return None;
    }
    // unsigned_abs keeps i32::MIN positive
    Some(rolling_hash(key).unsigned_abs() as usize % shard_count)
}

enum Matcher {
    Contains(String),
    Prefix(String),
    Regex(Regex),
}

impl Matcher {
    fn compile(rule: &KeyRule) -> Result<Self> {
        Ok(match rule {
            KeyRule::Contains(s) => Matcher::Contains(s.clone()),
            KeyRule::Prefix(s) => Matcher::Prefix(s.clone()),
            KeyRule::Regex(pattern) => Matcher::Regex(
                Regex::new(pattern)
                    .map_err(|e| RouterError::Config(format!("invalid regex '{}': {}", pattern, e)))?,
            ),
        })
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Matcher::Contains(s) => key.contains(s.as_str()),
            Matcher::Prefix(s) => key.starts_with(s.as_str()),
            Matcher::Regex(re) => re.is_match(key),
        }
    }
}

/// Maps shard keys to shard ids.
///
/// Rules are tried in shard order, then rule order; the first match wins.
/// Keys matching no rule are hashed over all shards in configuration order.
pub struct KeyRouter {
    shard_ids: Vec<String>,
    rules: Vec<(Matcher, usize)>,
    default_shard: Option<usize>,
}

impl KeyRouter {
    /// `shards` pairs each shard id with its override rules, in stable order.
    pub fn new<'a>(
        shards: impl IntoIterator<Item = (&'a str, &'a [KeyRule])>,
        default_shard: Option<&str>,
    ) -> Result<Self> {
        let mut shard_ids = Vec::new();
        let mut rules = Vec::new();

        for (position, (id, shard_rules)) in shards.into_iter().enumerate() {
            shard_ids.push(id.to_string());
            for rule in shard_rules {
                rules.push((Matcher::compile(rule)?, position));
            }
        }

        let default_shard = default_shard
            .map(|id| {
                shard_ids.iter().position(|s| s == id).ok_or_else(|| {
                    RouterError::Config(format!("Default shard '{}' is not configured", id))
                })
            })
            .transpose()?;

        Ok(Self {
            shard_ids,
            rules,
            default_shard,
        })
    }

    pub fn from_registry(registry: &ShardRegistry, default_shard: Option<&str>) -> Result<Self> {
        Self::new(
            registry.all().iter().map(|s| (s.id(), s.key_rules())),
            default_shard,
        )
    }

    /// Resolve a shard key to a shard id.
    ///
    /// A missing or blank key goes to the configured default shard.
    pub fn resolve(&self, key: Option<&str>) -> Result<&str> {
        if self.shard_ids.is_empty() {
            return Err(RouterError::UnavailableShard("No shards are registered".into()));
        }

        let key = match key {
            Some(key) if !key.trim().is_empty() => key,
            _ => {
                return self
                    .default_shard
                    .map(|position| self.shard_ids[position].as_str())
                    .ok_or_else(|| {
                        RouterError::UnavailableShard(
                            "Request has no shard key and no default shard is configured".into(),
                        )
                    });
            }
        };

        if let Some((_, position)) = self.rules.iter().find(|(matcher, _)| matcher.matches(key)) {
            return Ok(self.shard_ids[*position].as_str());
        }

        hash_index(key, self.shard_ids.len())
            .map(|position| self.shard_ids[position].as_str())
            .ok_or_else(|| RouterError::UnavailableShard(format!("No shard for key '{}'", key)))
    }
}
