use std::time::Duration;

use bson::doc;
use mongo_proxy_rs::{
    cfg::config::{RouteRule, RouterConfig},
    cluster::router::RouterManager,
    error::ProxyError,
};

fn router(default_set: Option<&str>, routes: Vec<RouteRule>) -> RouterManager {
    RouterManager::new(&RouterConfig {
        router_check_interval: Duration::from_secs(1),
        default_set: default_set.map(str::to_string),
        routes,
    })
}

fn rule(ns: &str, shard_key: &str, sets: &[&str]) -> RouteRule {
    RouteRule {
        ns: ns.to_string(),
        shard_key: shard_key.to_string(),
        sets: sets.iter().map(|s| s.to_string()).collect(),
    }
}

#[test]
fn single_set_rule_routes_directly() {
    let r = router(None, vec![rule("shop.orders", "id", &["setA"])]);
    let set = r
        .query_shard("shop.orders", Some(&doc! { "id": 1 }))
        .expect("routes");
    assert_eq!(set, "setA");
}

#[test]
fn hash_routing_is_stable() {
    let r = router(None, vec![rule("shop.orders", "id", &["setA", "setB", "setC"])]);

    let first = r
        .query_shard("shop.orders", Some(&doc! { "id": 42 }))
        .expect("routes");
    for _ in 0..10 {
        let again = r
            .query_shard("shop.orders", Some(&doc! { "id": 42 }))
            .expect("routes");
        assert_eq!(again, first);
    }
    assert!(["setA", "setB", "setC"].contains(&first.as_str()));
}

#[test]
fn any_key_type_routes_to_a_listed_set() {
    let r = router(None, vec![rule("shop.orders", "id", &["setA", "setB"])]);
    for key in [doc! { "id": 1 }, doc! { "id": "one" }, doc! { "id": 1.5 }] {
        let set = r.query_shard("shop.orders", Some(&key)).expect("routes");
        assert!(["setA", "setB"].contains(&set.as_str()));
    }
}

#[test]
fn missing_shard_key_falls_back_to_first_set() {
    let r = router(None, vec![rule("shop.orders", "id", &["setB", "setA"])]);
    let set = r
        .query_shard("shop.orders", Some(&doc! { "name": "x" }))
        .expect("routes");
    assert_eq!(set, "setB");

    let set = r.query_shard("shop.orders", None).expect("routes");
    assert_eq!(set, "setB");
}

#[test]
fn unknown_namespace_uses_default_set() {
    let r = router(Some("setZ"), vec![]);
    assert_eq!(r.query_shard("other.coll", None).expect("routes"), "setZ");
}

#[test]
fn unknown_namespace_without_default_is_a_route_error() {
    let r = router(None, vec![]);
    let err = r.query_shard("other.coll", None).expect_err("must fail");
    assert!(matches!(err, ProxyError::Route(_)), "got {err:?}");
}

#[test]
fn lookups_are_cached() {
    let r = router(None, vec![rule("shop.orders", "id", &["setA", "setB"])]);
    assert_eq!(r.cache_len(), 0);
    r.query_shard("shop.orders", Some(&doc! { "id": 5 }))
        .expect("routes");
    assert_eq!(r.cache_len(), 1);
    r.query_shard("shop.orders", Some(&doc! { "id": 5 }))
        .expect("routes");
    assert_eq!(r.cache_len(), 1);
}
