use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Remaining balance below this share of the total limit is flagged as low.
pub const LOW_BALANCE_RATIO: f64 = 0.2;

/// Body of a `GetUsageLimits` response as saved by the IDE or fetched by hand.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UsageLimitsResponse {
    pub subscription_info: SubscriptionInfo,
    pub usage_breakdown_list: Vec<UsageBreakdown>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub subscription_title: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct UsageBreakdown {
    pub display_name: String,
    pub usage_limit_with_precision: f64,
    pub current_usage_with_precision: f64,
    pub free_trial_info: Option<FreeTrialInfo>,
    pub bonuses: Option<Vec<Bonus>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct FreeTrialInfo {
    pub usage_limit_with_precision: f64,
    pub current_usage_with_precision: f64,
    pub free_trial_status: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Bonus {
    pub bonus_code: String,
    pub usage_limit: f64,
    pub current_usage: f64,
    pub status: String,
}

impl UsageBreakdown {
    /// `(limit, used)` across the base quota, the free trial and every bonus.
    fn totals(&self) -> (f64, f64) {
        let mut limit = self.usage_limit_with_precision;
        let mut used = self.current_usage_with_precision;
        if let Some(trial) = &self.free_trial_info {
            limit += trial.usage_limit_with_precision;
            used += trial.current_usage_with_precision;
        }
        for bonus in self.bonuses.iter().flatten() {
            limit += bonus.usage_limit;
            used += bonus.current_usage;
        }
        (limit, used)
    }
}

/// Credit balance derived from a usage-limits response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageInfo {
    pub subscription_title: String,
    pub usage_limit: f64,
    pub current_usage: f64,
    pub balance: f64,
    pub is_low_balance: bool,
}

pub fn calculate_balance(response: Option<&UsageLimitsResponse>) -> UsageInfo {
    let Some(response) = response else {
        return UsageInfo::default();
    };
    let (usage_limit, current_usage) = response
        .usage_breakdown_list
        .iter()
        .map(UsageBreakdown::totals)
        .fold((0.0, 0.0), |(limit, used), (l, u)| (limit + l, used + u));
    let balance = usage_limit - current_usage;
    UsageInfo {
        subscription_title: response.subscription_info.subscription_title.clone(),
        usage_limit,
        current_usage,
        balance,
        is_low_balance: usage_limit > 0.0 && balance / usage_limit < LOW_BALANCE_RATIO,
    }
}

/// Balance for a saved response. Missing or malformed files yield an
/// empty [`UsageInfo`].
pub fn load_usage(path: &Path) -> UsageInfo {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no usage limits file");
            return UsageInfo::default();
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring unreadable usage limits: {err}");
            return UsageInfo::default();
        }
    };
    match serde_json::from_str::<UsageLimitsResponse>(&text) {
        Ok(response) => calculate_balance(Some(&response)),
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring malformed usage limits: {err}");
            UsageInfo::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "subscriptionInfo": {"subscriptionTitle": "KIRO FREE", "type": "Q_DEVELOPER_STANDALONE_FREE"},
        "usageBreakdownList": [
            {
                "displayName": "Credits",
                "usageLimitWithPrecision": 50.0,
                "currentUsageWithPrecision": 12.5,
                "freeTrialInfo": {
                    "usageLimitWithPrecision": 500.0,
                    "currentUsageWithPrecision": 480.0,
                    "freeTrialStatus": "ACTIVE"
                },
                "bonuses": [
                    {"bonusCode": "WELCOME", "usageLimit": 100.0, "currentUsage": 7.5, "status": "ACTIVE"}
                ]
            }
        ],
        "nextDateReset": 1767225600
    }"#;

    #[test]
    fn absent_response_yields_zeroed_info() {
        assert_eq!(calculate_balance(None), UsageInfo::default());
    }

    #[test]
    fn empty_breakdown_list_is_not_low() {
        let response = UsageLimitsResponse {
            subscription_info: SubscriptionInfo {
                subscription_title: "TEST".to_string(),
            },
            usage_breakdown_list: Vec::new(),
        };
        let info = calculate_balance(Some(&response));
        assert_eq!(info.subscription_title, "TEST");
        assert_eq!((info.usage_limit, info.current_usage, info.balance), (0.0, 0.0, 0.0));
        assert!(!info.is_low_balance);
    }

    #[test]
    fn trial_and_bonus_quotas_count_toward_balance() {
        let response: UsageLimitsResponse = serde_json::from_str(SAMPLE).unwrap();
        let info = calculate_balance(Some(&response));
        assert_eq!(info.subscription_title, "KIRO FREE");
        assert_eq!(info.usage_limit, 650.0);
        assert_eq!(info.current_usage, 500.0);
        assert_eq!(info.balance, 150.0);
        assert!(!info.is_low_balance);
    }

    #[test]
    fn null_bonuses_and_missing_trial_are_tolerated() {
        let response: UsageLimitsResponse = serde_json::from_str(
            r#"{"usageBreakdownList":[{"usageLimitWithPrecision":10,"currentUsageWithPrecision":9,"bonuses":null}]}"#,
        )
        .unwrap();
        let info = calculate_balance(Some(&response));
        assert_eq!(info.balance, 1.0);
        assert!(info.is_low_balance);
    }

    #[test]
    fn load_degrades_to_empty_info() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");
        assert_eq!(load_usage(&path), UsageInfo::default());

        fs::write(&path, "{\"usageBreakdownList\": 3}").unwrap();
        assert_eq!(load_usage(&path), UsageInfo::default());

        fs::write(&path, SAMPLE).unwrap();
        assert_eq!(load_usage(&path).balance, 150.0);
    }

    prop_compose! {
        fn arbitrary_bonus()(limit in 0u32..2000, used in 0u32..2000) -> Bonus {
            Bonus {
                bonus_code: "test-bonus".to_string(),
                usage_limit: f64::from(limit),
                current_usage: f64::from(used),
                status: "ACTIVE".to_string(),
            }
        }
    }

    prop_compose! {
        fn arbitrary_breakdown()(
            limit in 0u32..10_000,
            used in 0u32..10_000,
            trial in proptest::option::of((0u32..1000, 0u32..1000)),
            bonuses in prop::collection::vec(arbitrary_bonus(), 0..3),
        ) -> UsageBreakdown {
            UsageBreakdown {
                display_name: "test".to_string(),
                usage_limit_with_precision: f64::from(limit),
                current_usage_with_precision: f64::from(used),
                free_trial_info: trial.map(|(limit, used)| FreeTrialInfo {
                    usage_limit_with_precision: f64::from(limit),
                    current_usage_with_precision: f64::from(used),
                    free_trial_status: "ACTIVE".to_string(),
                }),
                bonuses: (!bonuses.is_empty()).then_some(bonuses),
            }
        }
    }

    proptest! {
        #[test]
        fn prop_balance_is_total_limit_minus_total_usage(
            list in prop::collection::vec(arbitrary_breakdown(), 1..10)
        ) {
            let mut limit = 0.0;
            let mut used = 0.0;
            for breakdown in &list {
                limit += breakdown.usage_limit_with_precision;
                used += breakdown.current_usage_with_precision;
                if let Some(trial) = &breakdown.free_trial_info {
                    limit += trial.usage_limit_with_precision;
                    used += trial.current_usage_with_precision;
                }
                for bonus in breakdown.bonuses.iter().flatten() {
                    limit += bonus.usage_limit;
                    used += bonus.current_usage;
                }
            }
            let response = UsageLimitsResponse {
                usage_breakdown_list: list,
                ..UsageLimitsResponse::default()
            };
            let info = calculate_balance(Some(&response));
            prop_assert!((info.usage_limit - limit).abs() < 1e-4);
            prop_assert!((info.current_usage - used).abs() < 1e-4);
            prop_assert!((info.balance - (limit - used)).abs() < 1e-4);
        }

        #[test]
        fn prop_low_balance_below_a_fifth_of_the_limit(
            limit in 0u32..10_000,
            used in 0u32..10_000
        ) {
            let (limit, used) = (f64::from(limit), f64::from(used));
            let response = UsageLimitsResponse {
                usage_breakdown_list: vec![UsageBreakdown {
                    usage_limit_with_precision: limit,
                    current_usage_with_precision: used,
                    ..UsageBreakdown::default()
                }],
                ..UsageLimitsResponse::default()
            };
            let expected = limit > 0.0 && (limit - used) / limit < 0.2;
            prop_assert_eq!(calculate_balance(Some(&response)).is_low_balance, expected);
        }
    }
}
