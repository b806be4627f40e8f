//! Property checks over random constraint sequences.

use chrono::Utc;
use proptest::prelude::*;

use ess_power_arbiter::domain::{
    DeviceId, DeviceSpec, RatedLimits, RecordingChannel, TelemetryCache, TelemetrySnapshot,
};
use ess_power_arbiter::power::{
    Arbiter, ArbiterConfig, Constraint, ConstraintSet, Envelope, Phase, PowerType, Relationship,
    SolvedPoint, Variable,
};

const TOLERANCE: f64 = 1.0;

fn relationship() -> impl Strategy<Value = Relationship> {
    prop_oneof![
        Just(Relationship::Equals),
        Just(Relationship::LessOrEquals),
        Just(Relationship::GreaterOrEquals),
    ]
}

fn power_type() -> impl Strategy<Value = PowerType> {
    prop_oneof![Just(PowerType::Active), Just(PowerType::Reactive)]
}

fn constraint() -> impl Strategy<Value = Constraint> {
    (power_type(), relationship(), -12_000.0..12_000.0_f64).prop_map(|(pt, rel, target)| {
        Constraint::simple(
            "random",
            Variable::new("ess0", Phase::All, pt),
            rel,
            target,
        )
    })
}

fn limited_set() -> ConstraintSet {
    let mut set = ConstraintSet::new(DeviceId::from("ess0"), TOLERANCE);
    for var in DeviceSpec::symmetric("ess0").variables() {
        set.set_limits(var, -10_000.0, 10_000.0);
    }
    set
}

proptest! {
    #[test]
    fn accepted_constraints_only_narrow_ranges(constraints in prop::collection::vec(constraint(), 1..12)) {
        let mut set = limited_set();
        let vars = DeviceSpec::symmetric("ess0").variables();

        for c in constraints {
            let before: Vec<_> = vars.iter().map(|v| set.feasible_range(v)).collect();
            let len = set.len();
            match set.validate_and_add(c) {
                Ok(()) => {
                    prop_assert_eq!(set.len(), len + 1);
                    for (v, (lo, hi)) in vars.iter().zip(before) {
                        let (new_lo, new_hi) = set.feasible_range(v);
                        prop_assert!(new_lo >= lo - TOLERANCE);
                        prop_assert!(new_hi <= hi + TOLERANCE);
                        prop_assert!(new_lo <= new_hi + TOLERANCE);
                    }
                }
                Err(_) => {
                    prop_assert_eq!(set.len(), len);
                    for (v, range) in vars.iter().zip(before) {
                        prop_assert_eq!(set.feasible_range(v), range);
                    }
                }
            }
        }
    }

    #[test]
    fn reset_is_idempotent(constraints in prop::collection::vec(constraint(), 0..8)) {
        let mut set = limited_set();
        for c in constraints {
            let _ = set.validate_and_add(c);
        }
        set.reset();
        set.reset();

        prop_assert!(set.is_empty());
        let p = Variable::active("ess0", Phase::All);
        prop_assert_eq!(set.feasible_range(&p), (f64::NEG_INFINITY, f64::INFINITY));
        prop_assert!(set.pinned(&p).is_none());
    }

    #[test]
    fn applied_point_stays_inside_apparent_power(
        apparent in 1_000.0..20_000.0_f64,
        constraints in prop::collection::vec(constraint(), 0..6),
    ) {
        let id = DeviceId::from("ess0");
        let mut arbiter = Arbiter::new(ArbiterConfig::default());
        arbiter.register_device(DeviceSpec::symmetric("ess0")).unwrap();

        let mut cache = TelemetryCache::new();
        cache.update(id.clone(), TelemetrySnapshot::new_now(50.0, RatedLimits::symmetric(apparent)));

        arbiter.begin_cycle(&cache, Utc::now());
        for c in constraints {
            let _ = arbiter.submit(&id, c);
        }
        let mut channel = RecordingChannel::new();
        let report = arbiter.end_cycle(&mut channel);

        let applied = &report.outcome(&id).unwrap().applied;
        let p = applied.value(Phase::All, PowerType::Active);
        let q = applied.value(Phase::All, PowerType::Reactive);
        prop_assert!((p * p + q * q).sqrt() <= apparent + 1.0);
    }

    #[test]
    fn clamp_lands_inside_envelope(
        facets in 8usize..64,
        p in -50_000.0..50_000.0_f64,
        q in -50_000.0..50_000.0_f64,
    ) {
        let spec = DeviceSpec::symmetric("ess0").with_facets(facets);
        let snapshot = TelemetrySnapshot::new_now(50.0, RatedLimits::symmetric(10_000.0));
        let envelope = Envelope::from_telemetry(&spec, Some(&snapshot), Utc::now());

        let mut point = SolvedPoint::new(DeviceId::from("ess0"));
        point.set(Variable::active("ess0", Phase::All), p);
        point.set(Variable::reactive("ess0", Phase::All), q);

        prop_assert!(envelope.contains(&envelope.clamp(&point), 1e-6));
    }
}
