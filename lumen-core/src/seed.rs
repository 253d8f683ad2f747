use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};

/// Largest seed drawn at random; keeps seeds representable as i64.
const MAX_RANDOM_SEED: u64 = i64::MAX as u64;

/// Per-image seeds of one run, in image order.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SeedPlan {
    seeds: Vec<u64>,
    random: bool,
}

impl SeedPlan {
    pub fn seeds(&self) -> &[u64] {
        &self.seeds
    }

    /// Whether the seeds were drawn at random rather than derived from a base.
    pub fn is_random(&self) -> bool {
        self.random
    }
}

/// Plans the seeds of a batch.
///
/// With a base seed the plan is `base, base + 1, ...`, so a larger `count`
/// extends the batch without changing earlier images. A missing or zero
/// base draws every seed independently.
pub fn plan_seeds(base: Option<u64>, count: usize) -> SeedPlan {
    match base.filter(|&seed| seed != 0) {
        Some(base) => SeedPlan {
            seeds: (0..count as u64).map(|i| base.wrapping_add(i)).collect(),
            random: false,
        },
        None => {
            let mut rng = rand::thread_rng();
            SeedPlan {
                seeds: (0..count)
                    .map(|_| rng.gen_range(1..=MAX_RANDOM_SEED))
                    .collect(),
                random: true,
            }
        }
    }
}

/// Parses a seed typed as text. Empty, zero or malformed input means random.
pub fn parse_seed(text: &str) -> Option<u64> {
    text.trim().parse::<u64>().ok().filter(|&seed| seed != 0)
}

/// Accepts a seed as a JSON number, a decimal string, or null.
pub(crate) fn deserialize_seed<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SeedRepr {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<SeedRepr>::deserialize(deserializer)? {
        Some(SeedRepr::Number(seed)) => Some(seed).filter(|&s| s != 0),
        Some(SeedRepr::Text(text)) => parse_seed(&text),
        None => None,
    })
}
