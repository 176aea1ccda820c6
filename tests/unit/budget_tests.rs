use agent_conductor::errors::BudgetMetric;
use agent_conductor::models::budget::{Budget, Usage};
use agent_conductor::AppError;

fn usage(cost_usd: f64, turns: u32) -> Usage {
    Usage { cost_usd, turns }
}

#[test]
fn usage_equal_to_ceiling_is_within_budget() {
    let budget = Budget {
        max_budget_usd: Some(1.0),
        max_turns: Some(5),
    };
    assert!(budget.check("s", &usage(1.0, 5)).is_ok());
}

#[test]
fn cost_is_checked_before_turns() {
    let budget = Budget {
        max_budget_usd: Some(1.0),
        max_turns: Some(5),
    };
    match budget.check("s", &usage(1.01, 9)) {
        Err(AppError::BudgetExceeded { metric, limit, .. }) => {
            assert_eq!(metric, BudgetMetric::CostUsd);
            assert!((limit - 1.0).abs() < f64::EPSILON);
        }
        other => panic!("expected budget trip, got {other:?}"),
    }
}

#[test]
fn turns_trip_when_cost_is_unbounded() {
    let budget = Budget {
        max_budget_usd: None,
        max_turns: Some(2),
    };
    assert!(matches!(
        budget.check("s", &usage(100.0, 3)),
        Err(AppError::BudgetExceeded {
            metric: BudgetMetric::Turns,
            ..
        })
    ));
}

#[test]
fn unbounded_budget_never_trips() {
    assert!(Budget::default().is_unbounded());
    assert!(Budget::default().check("s", &usage(1e9, u32::MAX)).is_ok());
}

#[test]
fn or_fills_only_missing_ceilings() {
    let own = Budget {
        max_budget_usd: Some(0.5),
        max_turns: None,
    };
    let merged = own.or(Budget {
        max_budget_usd: Some(3.0),
        max_turns: Some(7),
    });
    assert_eq!(merged.max_budget_usd, Some(0.5));
    assert_eq!(merged.max_turns, Some(7));
}

#[test]
fn validate_rejects_non_positive_ceilings() {
    for bad in [
        Budget {
            max_budget_usd: Some(-1.0),
            max_turns: None,
        },
        Budget {
            max_budget_usd: Some(f64::NAN),
            max_turns: None,
        },
        Budget {
            max_budget_usd: None,
            max_turns: Some(0),
        },
    ] {
        assert!(matches!(bad.validate(), Err(AppError::Validation(_))), "{bad:?}");
    }
}
