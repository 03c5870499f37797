use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::config::BehaviorSection;

pub type BehaviorResult<T> = Result<T, BehaviorError>;

#[derive(Debug, Error)]
pub enum BehaviorError {
    #[error("invalid {field} range: {min} > {max}")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
    },
    #[error("{field} must be a probability in [0, 1], got {value}")]
    InvalidProbability { field: &'static str, value: f64 },
    #[error("scroll depth must stay within 0..=100, got {0}")]
    DepthOutOfBounds(u8),
    #[error("no search queries configured")]
    NoQueries,
}

/// Stateless probability model for per-session interaction decisions.
///
/// Every draw is independent and takes the RNG from the caller, so tests can
/// seed a `ChaCha20Rng` once and replay a whole session deterministically.
#[derive(Debug, Clone)]
pub struct BehaviorEngine {
    config: BehaviorSection,
}

impl BehaviorEngine {
    pub fn new(config: BehaviorSection) -> BehaviorResult<Self> {
        validate_probability("click_probability", config.click_probability)?;
        validate_probability("scroll_probability", config.scroll_probability)?;
        validate_range(
            "scroll_depth_pct",
            config.scroll_depth_pct[0] as f64,
            config.scroll_depth_pct[1] as f64,
        )?;
        if config.scroll_depth_pct[1] > 100 {
            return Err(BehaviorError::DepthOutOfBounds(config.scroll_depth_pct[1]));
        }
        validate_range("dwell_time_s", config.dwell_time_s[0], config.dwell_time_s[1])?;
        validate_range(
            "click_delay_s",
            config.click_delay_s[0],
            config.click_delay_s[1],
        )?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BehaviorSection {
        &self.config
    }

    pub fn should_click(&self, rng: &mut impl Rng) -> bool {
        rng.gen_bool(self.config.click_probability)
    }

    pub fn should_scroll(&self, rng: &mut impl Rng) -> bool {
        rng.gen_bool(self.config.scroll_probability)
    }

    /// Scroll depth as a percentage of page height, inclusive of both bounds.
    pub fn scroll_depth(&self, rng: &mut impl Rng) -> u8 {
        let [min, max] = self.config.scroll_depth_pct;
        rng.gen_range(min..=max)
    }

    pub fn dwell_time(&self, rng: &mut impl Rng) -> Duration {
        let [min, max] = self.config.dwell_time_s;
        Duration::from_secs_f64(rng.gen_range(min..=max))
    }

    pub fn click_delay(&self, rng: &mut impl Rng) -> Duration {
        let [min, max] = self.config.click_delay_s;
        Duration::from_secs_f64(rng.gen_range(min..=max))
    }

    pub fn random_query(&self, rng: &mut impl Rng) -> BehaviorResult<String> {
        self.config
            .search_queries
            .choose(rng)
            .cloned()
            .ok_or(BehaviorError::NoQueries)
    }

    pub fn queries(&self) -> &[String] {
        &self.config.search_queries
    }
}

impl Default for BehaviorEngine {
    fn default() -> Self {
        Self {
            config: BehaviorSection::default(),
        }
    }
}

fn validate_probability(field: &'static str, value: f64) -> BehaviorResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(BehaviorError::InvalidProbability { field, value });
    }
    Ok(())
}

fn validate_range(field: &'static str, min: f64, max: f64) -> BehaviorResult<()> {
    if min > max || min < 0.0 {
        return Err(BehaviorError::InvalidRange { field, min, max });
    }
    Ok(())
}
