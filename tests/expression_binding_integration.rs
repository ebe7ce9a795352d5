//! Expressions evaluated against registry sources

mod common;

use common::{file_source_path, TestEnv};
use imdash_core::config::dashboard::base_dir;
use imdash_core::scripting::{Expression, ExpressionEngine};
use imdash_core::{DashError, DashboardFile, SharedStore, SubPath};
use serde_json::json;

#[test]
fn test_bound_and_scaled_equivalence() {
    let mut env = TestEnv::new();
    SharedStore::create(&env.shm_dir(), "s", 1024, &json!({"v": 1.25, "arr": [1.0, 2.0]})).unwrap();
    let engine = ExpressionEngine::default();

    for path in ["/stores/s/v", "/stores/s/arr"] {
        let mut plain = Expression::bound(format!("{{{}}}", path));
        let mut scaled = Expression::bound(format!("5*{{{}}}", path));

        env.registry.begin_frame();
        let data = env.registry.resolve(path).data().to_json();
        let plain_value = plain.evaluate_json(&engine, &mut env.registry).unwrap();
        let scaled_value = scaled.evaluate_json(&engine, &mut env.registry).unwrap();
        env.registry.end_frame();

        assert_eq!(plain_value, data);
        let expected = match &data {
            serde_json::Value::Array(items) => json!(items
                .iter()
                .map(|v| v.as_f64().unwrap() * 5.0)
                .collect::<Vec<_>>()),
            v => json!(v.as_f64().unwrap() * 5.0),
        };
        assert_eq!(scaled_value, expected);
    }
}

#[test]
fn test_evaluation_keeps_source_alive() {
    let mut env = TestEnv::new();
    let path = env.write_file("v.json", "3");
    let engine = ExpressionEngine::default();
    let mut expr = Expression::bound(format!("{{{}}} + 1", path));

    for _ in 0..3 {
        env.registry.begin_frame();
        assert_eq!(expr.evaluate_json(&engine, &mut env.registry).unwrap(), json!(4));
        assert_eq!(env.registry.end_frame(), 0);
    }
    assert!(env.registry.contains(&path));

    // The widget stops evaluating: the source goes away
    assert_eq!(env.frame(&[]), 1);
    assert!(!env.registry.contains(&path));
}

#[test]
fn test_write_reaches_other_readers() {
    let mut env = TestEnv::new();
    SharedStore::create(&env.shm_dir(), "params", 1024, &json!({"gain": 1.0})).unwrap();
    let engine = ExpressionEngine::default();
    let mut slider = Expression::bound("{/stores/params/gain}");

    env.registry.begin_frame();
    slider.write(json!(2.5), &mut env.registry).unwrap();
    env.registry.end_frame();

    let reader = SharedStore::open(&env.shm_dir(), "params").unwrap();
    assert_eq!(reader.read(&SubPath::parse("gain").unwrap()).unwrap(), json!(2.5));

    env.registry.begin_frame();
    assert!(slider.is_stale(&mut env.registry));
    assert_eq!(slider.evaluate_json(&engine, &mut env.registry).unwrap(), json!(2.5));
    env.registry.end_frame();
}

#[test]
fn test_topic_expression_and_absent_source() {
    let mut env = TestEnv::new();
    env.bus.advertise("/odom", "nav_msgs/Odometry");
    let engine = ExpressionEngine::default();
    let mut x = Expression::bound("10 * {/topics/odom.pose.position.x}");

    env.registry.begin_frame();
    // Subscribed but nothing received yet: the source exists with no data
    assert!(x.evaluate(&engine, &mut env.registry).is_err());
    env.registry.end_frame();

    env.bus
        .publish_json("/odom", &json!({"pose": {"position": {"x": 0.5, "y": 0.0}}}));
    assert!(env.wait_for_change("/topics/odom.pose.position.x"));

    env.registry.begin_frame();
    let value = x.evaluate(&engine, &mut env.registry).unwrap();
    assert_eq!(value.as_float().unwrap(), 5.0);
    env.registry.end_frame();

    env.bus.withdraw("/odom");
    env.registry.begin_frame();
    let err = x.evaluate(&engine, &mut env.registry).unwrap_err();
    assert!(matches!(err, DashError::SourceUnavailable(_)));
    env.registry.end_frame();
}

#[test]
fn test_saved_dashboard_evaluates() {
    let mut env = TestEnv::new();
    let data = env.dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("gain.json"), "2").unwrap();

    // Save a dashboard next to the data, then read it back
    let dash_path = env.dir.path().join("dash").join("main.json");
    let base = base_dir(&dash_path);
    let mut dash = DashboardFile::new("main");
    dash.push(
        "double",
        &Expression::bound(format!("2 * {{{}}}", file_source_path(&data.join("gain.json")))),
        &base,
    );
    dash.push("offset", &Expression::literal(0.5), &base);
    dash.save(&dash_path).unwrap();

    let engine = ExpressionEngine::default();
    let mut exprs = DashboardFile::load(&dash_path).unwrap().expressions(&base);
    env.registry.begin_frame();
    assert_eq!(exprs[0].1.evaluate_json(&engine, &mut env.registry).unwrap(), json!(4));
    assert_eq!(exprs[1].1.evaluate_json(&engine, &mut env.registry).unwrap(), json!(0.5));
    env.registry.end_frame();
}
