use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DeviceSection;

pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device catalog is empty")]
    EmptyCatalog,
    #[error("device profile '{0}' not found")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
        };
        f.write_str(label)
    }
}

/// Immutable device fingerprint descriptor. Mobile and touch traits are
/// derived from the device class rather than stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub class: DeviceClass,
}

impl DeviceProfile {
    pub fn is_mobile(&self) -> bool {
        matches!(self.class, DeviceClass::Mobile | DeviceClass::Tablet)
    }

    pub fn has_touch(&self) -> bool {
        self.class != DeviceClass::Desktop
    }

    pub fn device_scale_factor(&self) -> f64 {
        if self.class == DeviceClass::Desktop {
            1.0
        } else {
            2.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    profiles: Vec<DeviceProfile>,
}

impl DeviceRegistry {
    /// A caller-supplied catalog fully replaces the built-in one.
    pub fn new(profiles: Vec<DeviceProfile>) -> Self {
        Self { profiles }
    }

    pub fn from_config(section: &DeviceSection) -> Self {
        if section.profiles.is_empty() {
            Self::default()
        } else {
            Self::new(section.profiles.clone())
        }
    }

    pub fn random(&self, rng: &mut impl Rng) -> DeviceResult<&DeviceProfile> {
        self.profiles.choose(rng).ok_or(DeviceError::EmptyCatalog)
    }

    pub fn by_name(&self, name: &str) -> DeviceResult<&DeviceProfile> {
        self.profiles
            .iter()
            .find(|profile| profile.name == name)
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))
    }

    pub fn all(&self) -> Vec<DeviceProfile> {
        self.profiles.clone()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(builtin_catalog())
    }
}

fn builtin_catalog() -> Vec<DeviceProfile> {
    vec![
        DeviceProfile {
            name: "Desktop Chrome".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .into(),
            viewport_width: 1920,
            viewport_height: 1080,
            class: DeviceClass::Desktop,
        },
        DeviceProfile {
            name: "Desktop Firefox".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 \
                         Firefox/121.0"
                .into(),
            viewport_width: 1920,
            viewport_height: 1080,
            class: DeviceClass::Desktop,
        },
        DeviceProfile {
            name: "Mobile Chrome".into(),
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) \
                         AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 \
                         Safari/604.1"
                .into(),
            viewport_width: 375,
            viewport_height: 667,
            class: DeviceClass::Mobile,
        },
        DeviceProfile {
            name: "Mobile Safari".into(),
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) \
                         AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 \
                         Safari/604.1"
                .into(),
            viewport_width: 390,
            viewport_height: 844,
            class: DeviceClass::Mobile,
        },
        DeviceProfile {
            name: "Tablet iPad".into(),
            user_agent: "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X) AppleWebKit/605.1.15 \
                         (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1"
                .into(),
            viewport_width: 768,
            viewport_height: 1024,
            class: DeviceClass::Tablet,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    #[test]
    fn builtin_catalog_ships_five_profiles() {
        let registry = DeviceRegistry::default();
        assert_eq!(registry.len(), 5);
        let desktops = registry
            .all()
            .iter()
            .filter(|p| p.class == DeviceClass::Desktop)
            .count();
        let tablets = registry
            .all()
            .iter()
            .filter(|p| p.class == DeviceClass::Tablet)
            .count();
        assert_eq!(desktops, 2);
        assert_eq!(tablets, 1);
    }

    #[test]
    fn derived_flags_follow_device_class() {
        let registry = DeviceRegistry::default();
        let desktop = registry.by_name("Desktop Chrome").unwrap();
        assert!(!desktop.is_mobile());
        assert!(!desktop.has_touch());
        assert_eq!(desktop.device_scale_factor(), 1.0);

        let tablet = registry.by_name("Tablet iPad").unwrap();
        assert!(tablet.is_mobile());
        assert!(tablet.has_touch());
        assert_eq!(tablet.device_scale_factor(), 2.0);
    }

    #[test]
    fn unknown_name_reports_not_found() {
        let registry = DeviceRegistry::default();
        assert!(matches!(
            registry.by_name("Quest Headset"),
            Err(DeviceError::NotFound(name)) if name == "Quest Headset"
        ));
    }

    #[test]
    fn random_pick_fails_on_empty_catalog() {
        let registry = DeviceRegistry::new(Vec::new());
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        assert!(matches!(
            registry.random(&mut rng),
            Err(DeviceError::EmptyCatalog)
        ));
    }

    #[test]
    fn random_pick_comes_from_catalog() {
        let registry = DeviceRegistry::default();
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let device = registry.random(&mut rng).unwrap();
        assert!(registry.by_name(&device.name).is_ok());
    }
}
