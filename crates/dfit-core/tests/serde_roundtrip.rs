use dfit_core::{ConstraintSpec, DfitError, ErrorInfo, FitParameter, GaussConstraintMeta};

#[test]
fn parameter_round_trip_json() {
    let mut param = FitParameter::new("dm_s", 17.76).with_bounds(15.0, 20.0);
    param.second_stage = true;
    param.error = 0.021;
    param.gauss_constraint = Some(GaussConstraintMeta {
        mean: 17.765,
        width: 0.006,
    });

    let json = serde_json::to_string_pretty(&param).expect("serialize");
    let decoded: FitParameter = serde_json::from_str(&json).expect("deserialize");

    assert_eq!(decoded, param);
}

#[test]
fn parameter_defaults_omitted_fields() {
    // Workers only have to declare identity, start value, bounds and
    // flags; error fields default to zero on the coordinator side.
    let json = r#"{
        "name": "sig_yield",
        "value": 1000.0,
        "init_value": 1000.0,
        "gen_value": 1000.0,
        "min_bound": 0.0,
        "max_bound": 1e6,
        "fixed": false,
        "second_stage": false
    }"#;
    let decoded: FitParameter = serde_json::from_str(json).expect("deserialize");
    assert_eq!(decoded.error, 0.0);
    assert_eq!(decoded.global_correlation, 0.0);
    assert!(decoded.gauss_constraint.is_none());
}

#[test]
fn constraint_spec_round_trip_json() {
    let spec = ConstraintSpec {
        formula: "dm_s / dm_d".to_string(),
        operands: vec!["dm_s".to_string(), "dm_d".to_string()],
        mean: 35.1,
        width: 0.4,
    };
    let json = serde_json::to_string(&spec).expect("serialize");
    let decoded: ConstraintSpec = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(decoded, spec);
}

#[test]
fn error_payload_round_trip_json() {
    let err = DfitError::Config(
        ErrorInfo::new("free-count-mismatch", "minimizer supplied 4 values for 5 free parameters")
            .with_context("expected", "5")
            .with_context("supplied", "4")
            .with_hint("check fixed flags across workers"),
    );
    let json = serde_json::to_string(&err).expect("serialize");
    let decoded: DfitError = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(decoded, err);
    assert_eq!(decoded.info().code, "free-count-mismatch");
}
