//! Grading: classify a parsed summary against show-profile thresholds.
//!
//! The verdict is a pure function of (summary, profile); identical inputs
//! always produce the same verdict and the same reason list.

use crate::models::{Grading, ProfileId, Summary, Thresholds, Verdict};

/// Threshold set for a profile (MiB/s, ms, ratios).
pub fn thresholds(profile: ProfileId) -> Thresholds {
    match profile {
        ProfileId::QuickMaxMix => Thresholds {
            min_bw_mb: 300.0,
            rec_bw_mb: Some(500.0),
            excellent_bw_mb: Some(600.0),
            max_latency_ms: 2.0,
            min_read_iops: Some(20_000.0),
            min_stability_ratio: None,
        },
        ProfileId::Prores422Real => Thresholds {
            min_bw_mb: 350.0,
            rec_bw_mb: Some(500.0),
            excellent_bw_mb: Some(600.0),
            max_latency_ms: 3.0,
            min_read_iops: None,
            min_stability_ratio: None,
        },
        ProfileId::Prores422HqReal => Thresholds {
            min_bw_mb: 700.0,
            rec_bw_mb: Some(1_000.0),
            excellent_bw_mb: Some(1_200.0),
            max_latency_ms: 3.0,
            min_read_iops: None,
            min_stability_ratio: None,
        },
        ProfileId::ThermalMaximum => Thresholds {
            min_bw_mb: 400.0,
            rec_bw_mb: None,
            excellent_bw_mb: None,
            max_latency_ms: 3.0,
            min_read_iops: None,
            min_stability_ratio: Some(0.70),
        },
    }
}

/// Grade a summary against the profile's show thresholds.
pub fn evaluate(profile: ProfileId, summary: &Summary) -> Grading {
    let thr = thresholds(profile);
    let read_bw_mb = summary.read_bw_mb();
    let read_iops = summary.read_iops;
    let latency_ms = summary.avg_read_latency_ms;

    let mut reasons = Vec::new();

    if read_bw_mb < thr.min_bw_mb {
        reasons.push(format!(
            "read_bw_mb {read_bw_mb:.1} < min {:.0}",
            thr.min_bw_mb
        ));
    }
    if latency_ms > 0.0 && latency_ms > thr.max_latency_ms {
        reasons.push(format!(
            "latency {latency_ms:.2}ms > {:.1}ms",
            thr.max_latency_ms
        ));
    }
    if let Some(min_iops) = thr.min_read_iops {
        if read_iops < min_iops {
            reasons.push(format!("read_iops {read_iops:.0} < min {min_iops:.0}"));
        }
    }
    if let Some(min_ratio) = thr.min_stability_ratio {
        if let Some(ratio) = summary.stability_ratio {
            if ratio < min_ratio {
                reasons.push(format!("stability_ratio {ratio:.2} < min {min_ratio:.2}"));
            }
        }
    }

    let verdict = if !reasons.is_empty() {
        Verdict::Fail
    } else {
        match thr.excellent_bw_mb {
            Some(excellent) if read_bw_mb >= excellent && latency_ms <= thr.max_latency_ms => {
                Verdict::Excellent
            }
            _ => Verdict::Pass,
        }
    };

    Grading {
        profile,
        read_bw_mb,
        read_iops,
        avg_read_latency_ms: latency_ms,
        stability_ratio: summary.stability_ratio,
        thresholds: thr,
        verdict,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(read_bw_kib: f64, latency_ms: f64, iops: f64) -> Summary {
        Summary {
            read_bw_kib,
            read_iops: iops,
            avg_read_latency_ms: latency_ms,
            ..Default::default()
        }
    }

    #[test]
    fn test_quick_excellent() {
        // 600 MiB/s, 1.5 ms, 30k IOPS: clears the excellent bar.
        let grading = evaluate(
            ProfileId::QuickMaxMix,
            &summary(614_400.0, 1.5, 30_000.0),
        );
        assert_eq!(grading.verdict, Verdict::Excellent);
        assert!(grading.reasons.is_empty());
    }

    #[test]
    fn test_quick_throughput_floor_fail() {
        // 100 MiB/s is under the 300 MiB/s minimum.
        let grading = evaluate(
            ProfileId::QuickMaxMix,
            &summary(102_400.0, 1.0, 30_000.0),
        );
        assert_eq!(grading.verdict, Verdict::Fail);
        assert!(grading
            .reasons
            .iter()
            .any(|r| r == "read_bw_mb 100.0 < min 300"));
    }

    #[test]
    fn test_quick_iops_floor_fail() {
        let grading = evaluate(
            ProfileId::QuickMaxMix,
            &summary(614_400.0, 1.0, 12_000.0),
        );
        assert_eq!(grading.verdict, Verdict::Fail);
        assert!(grading
            .reasons
            .iter()
            .any(|r| r == "read_iops 12000 < min 20000"));
    }

    #[test]
    fn test_show_latency_fail() {
        // 700 MiB/s meets throughput, but 5 ms misses the 3 ms bound.
        let grading = evaluate(
            ProfileId::Prores422Real,
            &summary(716_800.0, 5.0, 8_000.0),
        );
        assert_eq!(grading.verdict, Verdict::Fail);
        assert!(grading.reasons.iter().any(|r| r == "latency 5.00ms > 3.0ms"));
    }

    #[test]
    fn test_show_pass_between_min_and_excellent() {
        // 450 MiB/s: above the 350 minimum, below the 600 excellent bar.
        let grading = evaluate(
            ProfileId::Prores422Real,
            &summary(460_800.0, 2.0, 8_000.0),
        );
        assert_eq!(grading.verdict, Verdict::Pass);
    }

    #[test]
    fn test_hq_show_needs_double_throughput() {
        let grading = evaluate(
            ProfileId::Prores422HqReal,
            &summary(614_400.0, 2.0, 8_000.0),
        );
        assert_eq!(grading.verdict, Verdict::Fail);

        let grading = evaluate(
            ProfileId::Prores422HqReal,
            &summary(1_331_200.0, 2.0, 8_000.0),
        );
        assert_eq!(grading.verdict, Verdict::Excellent);
    }

    #[test]
    fn test_thermal_stability_fail() {
        let mut s = summary(512_000.0, 2.0, 8_000.0);
        s.stability_ratio = Some(0.60);
        let grading = evaluate(ProfileId::ThermalMaximum, &s);
        assert_eq!(grading.verdict, Verdict::Fail);
        assert!(grading
            .reasons
            .iter()
            .any(|r| r.contains("stability_ratio 0.60 < min 0.70")));
    }

    #[test]
    fn test_thermal_pass_without_stability_fields() {
        // No stability ratio reported: the bound cannot fire.
        let grading = evaluate(
            ProfileId::ThermalMaximum,
            &summary(512_000.0, 2.0, 8_000.0),
        );
        assert_eq!(grading.verdict, Verdict::Pass);
    }

    #[test]
    fn test_thermal_has_no_excellent_tier() {
        let mut s = summary(5_120_000.0, 1.0, 80_000.0);
        s.stability_ratio = Some(0.95);
        let grading = evaluate(ProfileId::ThermalMaximum, &s);
        assert_eq!(grading.verdict, Verdict::Pass);
    }

    #[test]
    fn test_zero_latency_does_not_fail() {
        // Latency zero means "not reported", never a violation.
        let grading = evaluate(
            ProfileId::Prores422Real,
            &summary(716_800.0, 0.0, 8_000.0),
        );
        assert_eq!(grading.verdict, Verdict::Pass);
    }

    #[test]
    fn test_multiple_reasons_collected() {
        let grading = evaluate(ProfileId::QuickMaxMix, &summary(51_200.0, 9.0, 100.0));
        assert_eq!(grading.verdict, Verdict::Fail);
        assert_eq!(grading.reasons.len(), 3);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // The verdict is a pure function of (summary, profile).
            #[test]
            fn verdict_is_deterministic(
                bw in 0.0f64..4_000_000.0,
                lat in 0.0f64..20.0,
                iops in 0.0f64..100_000.0,
                ratio in proptest::option::of(0.0f64..1.0),
            ) {
                for profile in ProfileId::ALL {
                    let mut s = summary(bw, lat, iops);
                    s.stability_ratio = ratio;
                    let first = evaluate(profile, &s);
                    let second = evaluate(profile, &s);
                    prop_assert_eq!(first.verdict, second.verdict);
                    prop_assert_eq!(first.reasons, second.reasons);
                }
            }

            // A failing verdict always names at least one reason, and a
            // non-failing verdict names none.
            #[test]
            fn reasons_match_verdict(
                bw in 0.0f64..4_000_000.0,
                lat in 0.0f64..20.0,
                iops in 0.0f64..100_000.0,
            ) {
                for profile in ProfileId::ALL {
                    let grading = evaluate(profile, &summary(bw, lat, iops));
                    match grading.verdict {
                        Verdict::Fail => prop_assert!(!grading.reasons.is_empty()),
                        _ => prop_assert!(grading.reasons.is_empty()),
                    }
                }
            }
        }
    }
}
