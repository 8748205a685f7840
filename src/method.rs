//! Deletion methods and the policy that turns a method into an ordered pass plan.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::pattern::PatternKind;

/// Largest pass count accepted for the configurable pattern methods.
pub const MAX_PASSES: u32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeletionMethod {
    #[serde(rename = "zero-fill", alias = "zero")]
    ZeroFill,
    #[serde(rename = "random-fill", alias = "random")]
    RandomFill,
    #[serde(rename = "dod-5220.22-m", alias = "dod")]
    Dod522022M,
    #[serde(rename = "aes-wipe", alias = "aes")]
    AesWipe,
}

impl DeletionMethod {
    pub const ALL: [DeletionMethod; 4] = [
        DeletionMethod::ZeroFill,
        DeletionMethod::RandomFill,
        DeletionMethod::Dod522022M,
        DeletionMethod::AesWipe,
    ];

    /// Whether the caller's pass count has any effect on this method.
    ///
    /// DoD 5220.22-M is fixed at three passes by the standard and the AES wipe
    /// is a single crypto pass; for both, a supplied pass count is accepted and
    /// ignored rather than rejected.
    pub fn honours_pass_count(&self) -> bool {
        matches!(self, DeletionMethod::ZeroFill | DeletionMethod::RandomFill)
    }
}

impl fmt::Display for DeletionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletionMethod::ZeroFill => write!(f, "zero-fill"),
            DeletionMethod::RandomFill => write!(f, "random-fill"),
            DeletionMethod::Dod522022M => write!(f, "dod-5220.22-m"),
            DeletionMethod::AesWipe => write!(f, "aes-wipe"),
        }
    }
}

impl FromStr for DeletionMethod {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zero" | "zero-fill" | "zerofill" => Ok(DeletionMethod::ZeroFill),
            "random" | "random-fill" | "randomfill" => Ok(DeletionMethod::RandomFill),
            "dod" | "dod-5220.22-m" | "dod522022m" => Ok(DeletionMethod::Dod522022M),
            "aes" | "aes-wipe" | "aeswipe" => Ok(DeletionMethod::AesWipe),
            _ => Err(ConfigurationError::UnknownMethod(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Pattern(PatternKind),
    CryptoWipe,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassKind::Pattern(pattern) => write!(f, "pattern {}", pattern),
            PassKind::CryptoWipe => write!(f, "aes-256-gcm crypto wipe"),
        }
    }
}

/// One pass of a plan. `index` is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSpec {
    pub kind: PassKind,
    pub index: usize,
}

/// Map a method and configured pass count to its ordered pass plan.
pub fn plan(method: DeletionMethod, passes: u32) -> Result<Vec<PassSpec>, ConfigurationError> {
    let kinds: Vec<PassKind> = match method {
        DeletionMethod::ZeroFill => {
            vec![PassKind::Pattern(PatternKind::ZERO); validate_passes(passes)?]
        }
        DeletionMethod::RandomFill => {
            vec![PassKind::Pattern(PatternKind::Random); validate_passes(passes)?]
        }
        DeletionMethod::Dod522022M => vec![
            PassKind::Pattern(PatternKind::ZERO),
            PassKind::Pattern(PatternKind::ONES),
            PassKind::Pattern(PatternKind::Random),
        ],
        DeletionMethod::AesWipe => vec![PassKind::CryptoWipe],
    };

    Ok(kinds
        .into_iter()
        .enumerate()
        .map(|(i, kind)| PassSpec { kind, index: i + 1 })
        .collect())
}

fn validate_passes(passes: u32) -> Result<usize, ConfigurationError> {
    if (1..=MAX_PASSES).contains(&passes) {
        Ok(passes as usize)
    } else {
        Err(ConfigurationError::InvalidPassCount {
            value: passes,
            max: MAX_PASSES,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn dod_is_fixed_at_three_passes() {
        for passes in [0, 1, 3, 7, 500] {
            let kinds: Vec<_> = plan(DeletionMethod::Dod522022M, passes)
                .unwrap()
                .into_iter()
                .map(|p| p.kind)
                .collect();
            assert_eq!(
                kinds,
                vec![
                    PassKind::Pattern(PatternKind::Fixed(0x00)),
                    PassKind::Pattern(PatternKind::Fixed(0xFF)),
                    PassKind::Pattern(PatternKind::Random),
                ]
            );
        }
    }

    #[test]
    fn aes_wipe_ignores_pass_count() {
        let passes = plan(DeletionMethod::AesWipe, 0).unwrap();
        assert_eq!(passes, vec![PassSpec { kind: PassKind::CryptoWipe, index: 1 }]);
    }

    #[test]
    fn pattern_methods_reject_out_of_range_counts() {
        assert!(matches!(
            plan(DeletionMethod::ZeroFill, 0),
            Err(ConfigurationError::InvalidPassCount { value: 0, .. })
        ));
        assert!(matches!(
            plan(DeletionMethod::RandomFill, MAX_PASSES + 1),
            Err(ConfigurationError::InvalidPassCount { .. })
        ));
    }

    #[test]
    fn method_names_parse() {
        assert_eq!("dod".parse::<DeletionMethod>().unwrap(), DeletionMethod::Dod522022M);
        assert_eq!("AES-Wipe".parse::<DeletionMethod>().unwrap(), DeletionMethod::AesWipe);
        assert!("gutmann".parse::<DeletionMethod>().is_err());
        for method in DeletionMethod::ALL {
            assert_eq!(method.to_string().parse::<DeletionMethod>().unwrap(), method);
        }
    }

    proptest! {
        #[test]
        fn zero_fill_plan_is_ordered_and_sized(passes in 1u32..=MAX_PASSES) {
            let plan = plan(DeletionMethod::ZeroFill, passes).unwrap();
            prop_assert_eq!(plan.len(), passes as usize);
            for (i, pass) in plan.iter().enumerate() {
                prop_assert_eq!(pass.index, i + 1);
                prop_assert_eq!(pass.kind, PassKind::Pattern(PatternKind::ZERO));
            }
        }
    }
}
