use std::time::Duration;

use mongo_proxy_rs::cfg::config::Config;

fn parse(yaml: &str) -> anyhow::Result<Config> {
    let mut cfg: Config = serde_yaml::from_str(yaml)?;
    cfg.validate_and_normalize()?;
    Ok(cfg)
}

const MINIMAL: &str = r#"
proxy: {}
pool: {}
router: {}
cluster:
  Sets:
    - Name: "setA"
      Members:
        - Host: "127.0.0.1:27017"
          Role: primary
"#;

#[test]
fn minimal_config_gets_defaults() {
    let cfg = parse(MINIMAL).expect("minimal config is valid");
    assert_eq!(cfg.proxy.proxy_address, "0.0.0.0:4000");
    assert_eq!(cfg.proxy.manage_address, "0.0.0.0:4001");
    assert_eq!(cfg.proxy.stat_address, "0.0.0.0:4002");
    assert_eq!(cfg.proxy.max_req_size, 16 * 1024 * 1024);
    assert_eq!(cfg.proxy.max_res_size, 16 * 1024 * 1024);
    assert_eq!(cfg.proxy.client_timeout, Duration::from_secs(5));
    assert_eq!(cfg.pool.conn_pool_size, 30);
    assert_eq!(cfg.pool.mongo_timeout, Duration::from_secs(5));
    assert_eq!(cfg.router.router_check_interval, Duration::from_secs(1));
    assert_eq!(cfg.cluster.topo_check_interval, Duration::from_secs(10));
}

#[test]
fn full_config_parses() {
    let yaml = r#"
proxy:
  ProxyAddress: "127.0.0.1:14000"
  MaxReqSize: 1048576
  ClientTimeout: 2
pool:
  ConnPoolSize: 4
  MongoTimeout: 3
router:
  RouterCheckInterval: 7
  DefaultSet: "setA"
  Routes:
    - Ns: "shop.orders"
      ShardKey: "id"
      Sets: ["setA", "setB"]
cluster:
  TopoCheckInterval: 30
  Sets:
    - Name: "setA"
      Members:
        - Host: "10.0.0.1:27017"
          Role: primary
        - Host: "10.0.0.2:27017"
          Role: secondary
    - Name: "setB"
      Members:
        - Host: "10.0.1.1:27017"
          Role: primary
"#;
    let cfg = parse(yaml).expect("full config is valid");
    assert_eq!(cfg.pool.conn_pool_size, 4);
    assert_eq!(cfg.router.routes.len(), 1);
    assert_eq!(cfg.router.router_check_interval, Duration::from_secs(7));
    assert_eq!(cfg.cluster.sets[0].members.len(), 2);
}

#[test]
fn route_to_unknown_set_rejected() {
    let yaml = r#"
proxy: {}
pool: {}
router:
  Routes:
    - Ns: "shop.orders"
      ShardKey: "id"
      Sets: ["nope"]
cluster:
  Sets:
    - Name: "setA"
      Members:
        - Host: "127.0.0.1:27017"
          Role: primary
"#;
    assert!(parse(yaml).is_err());
}

#[test]
fn set_without_primary_rejected() {
    let yaml = r#"
proxy: {}
pool: {}
router: {}
cluster:
  Sets:
    - Name: "setA"
      Members:
        - Host: "127.0.0.1:27017"
          Role: secondary
"#;
    assert!(parse(yaml).is_err());
}

#[test]
fn duplicate_set_name_rejected() {
    let yaml = r#"
proxy: {}
pool: {}
router: {}
cluster:
  Sets:
    - Name: "setA"
      Members:
        - Host: "127.0.0.1:27017"
          Role: primary
    - Name: "setA"
      Members:
        - Host: "127.0.0.1:27018"
          Role: primary
"#;
    assert!(parse(yaml).is_err());
}

#[test]
fn bad_member_host_rejected() {
    let yaml = r#"
proxy: {}
pool: {}
router: {}
cluster:
  Sets:
    - Name: "setA"
      Members:
        - Host: "no-port-here"
          Role: primary
"#;
    assert!(parse(yaml).is_err());
}
