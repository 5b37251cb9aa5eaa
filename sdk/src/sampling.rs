//! Session-level sampling.
//!
//! The decision is taken once, when the monitor is built, and applies to
//! every sampling-aware plugin for the life of the session. Plugins of the
//! [`Category::Abnormal`](crate::types::Category::Abnormal) category ignore it.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use tracing::warn;

use crate::isolate;
use crate::types::DeviceInfo;

/// Custom sampling predicate, given the device snapshot.
pub type SamplePredicate = Arc<dyn Fn(&DeviceInfo) -> bool + Send + Sync>;

/// How a session decides whether it is sampled in.
#[derive(Clone, Default)]
pub enum SamplingPolicy {
    /// Every session is sampled in.
    #[default]
    Always,

    /// A session is sampled in with the given probability, clamped to `[0, 1]`.
    Rate(f64),

    /// A caller-supplied decision based on the device.
    Predicate(SamplePredicate),
}

impl fmt::Debug for SamplingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Rate(rate) => f.debug_tuple("Rate").field(rate).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl SamplingPolicy {
    /// Builds the policy from configuration: a predicate wins over a rate.
    #[must_use]
    pub fn from_parts(sample_rate: f64, predicate: Option<SamplePredicate>) -> Self {
        match predicate {
            Some(predicate) => Self::Predicate(predicate),
            None if sample_rate >= 1.0 => Self::Always,
            None => Self::Rate(sample_rate),
        }
    }

    /// Makes the session's sampling decision.
    ///
    /// A predicate that panics samples the session out.
    ///
    /// # Example
    ///
    /// ```
    /// use sightline_sdk::sampling::SamplingPolicy;
    /// # use sightline_sdk::types::DeviceInfo;
    /// # let device = DeviceInfo {
    /// #     os: "linux".into(), arch: "x86_64".into(), hostname: "h".into(),
    /// #     language: None, cpu_count: 1, user_agent: "ua".into(),
    /// # };
    ///
    /// let mut rng = rand::rng();
    /// assert!(!SamplingPolicy::Rate(0.0).is_sampled(&device, &mut rng));
    /// assert!(SamplingPolicy::Always.is_sampled(&device, &mut rng));
    /// ```
    pub fn is_sampled<R: Rng + ?Sized>(&self, device: &DeviceInfo, rng: &mut R) -> bool {
        match self {
            Self::Always => true,
            Self::Rate(rate) => {
                let rate = rate.clamp(0.0, 1.0);
                if rate <= 0.0 {
                    false
                } else if rate >= 1.0 {
                    true
                } else {
                    rng.random::<f64>() < rate
                }
            }
            Self::Predicate(predicate) => match isolate::call(|| predicate(device)) {
                Ok(sampled) => sampled,
                Err(_) => {
                    warn!("Sampling predicate panicked, session sampled out");
                    false
                }
            },
        }
    }
}
