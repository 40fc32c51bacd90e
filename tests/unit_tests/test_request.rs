use bson::{Document, doc};
use hex_literal::hex;
use mongo_proxy_rs::{
    error::ProxyError,
    protocol::{
        opcode::Opcode,
        request::{RequestOp, cmd_ns, parse_request},
    },
};

fn doc_bytes(doc: &Document) -> Vec<u8> {
    bson::to_vec(doc).expect("test document marshals")
}

fn update_body(ns: &str, flags: i32, selector: &Document, update: &Document) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(ns.as_bytes());
    body.push(0);
    body.extend_from_slice(&flags.to_le_bytes());
    body.extend_from_slice(&doc_bytes(selector));
    body.extend_from_slice(&doc_bytes(update));
    body
}

fn insert_body(flags: i32, ns: &str, docs: &[Document]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&flags.to_le_bytes());
    body.extend_from_slice(ns.as_bytes());
    body.push(0);
    for d in docs {
        body.extend_from_slice(&doc_bytes(d));
    }
    body
}

fn query_body(
    flags: i32,
    ns: &str,
    skip: i32,
    n_return: i32,
    query: &Document,
    fields: Option<&Document>,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&flags.to_le_bytes());
    body.extend_from_slice(ns.as_bytes());
    body.push(0);
    body.extend_from_slice(&skip.to_le_bytes());
    body.extend_from_slice(&n_return.to_le_bytes());
    body.extend_from_slice(&doc_bytes(query));
    if let Some(f) = fields {
        body.extend_from_slice(&doc_bytes(f));
    }
    body
}

fn get_more_body(ns: &str, n_return: i32, cursor_id: i64) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(ns.as_bytes());
    body.push(0);
    body.extend_from_slice(&n_return.to_le_bytes());
    body.extend_from_slice(&cursor_id.to_le_bytes());
    body
}

fn delete_body(ns: &str, flags: i32, selector: &Document) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i32.to_le_bytes());
    body.extend_from_slice(ns.as_bytes());
    body.push(0);
    body.extend_from_slice(&flags.to_le_bytes());
    body.extend_from_slice(&doc_bytes(selector));
    body
}

#[test]
fn update_extracts_selector() {
    let selector = doc! { "id": 42 };
    let body = update_body("shop.orders", 1, &selector, &doc! { "$set": { "x": 1 } });

    let req = parse_request(Opcode::Update, &body).expect("update parses");
    assert_eq!(req.ns, "shop.orders");
    assert_eq!(req.flags, 1);
    match &req.op {
        RequestOp::Update { selector: s } => assert_eq!(s, &selector),
        other => panic!("unexpected op {other:?}"),
    }
    assert_eq!(req.shard_key(), Some(&selector));
    assert!(!req.slave_ok());
}

#[test]
fn insert_single_document() {
    let d = doc! { "id": 7, "name": "a" };
    let body = insert_body(0, "shop.orders", std::slice::from_ref(&d));

    let req = parse_request(Opcode::Insert, &body).expect("insert parses");
    assert_eq!(req.ns, "shop.orders");
    assert_eq!(req.shard_key(), Some(&d));
}

#[test]
fn insert_second_document_rejected() {
    let body = insert_body(0, "shop.orders", &[doc! { "id": 1 }, doc! { "id": 2 }]);
    let err = parse_request(Opcode::Insert, &body).expect_err("must reject");
    assert!(matches!(err, ProxyError::Parse(_)), "got {err:?}");
}

#[test]
fn query_extracts_flags_and_document() {
    let q = doc! { "id": 9 };
    let body = query_body(0x4, "shop.orders", 0, 10, &q, None);

    let req = parse_request(Opcode::Query, &body).expect("query parses");
    assert_eq!(req.ns, "shop.orders");
    assert!(req.slave_ok());
    match &req.op {
        RequestOp::Query {
            skip,
            n_return,
            query,
        } => {
            assert_eq!(*skip, 0);
            assert_eq!(*n_return, 10);
            assert_eq!(query, &q);
        },
        other => panic!("unexpected op {other:?}"),
    }
}

#[test]
fn query_without_slave_ok_flag() {
    let body = query_body(0, "shop.orders", 0, 1, &doc! {}, None);
    let req = parse_request(Opcode::Query, &body).expect("query parses");
    assert!(!req.slave_ok());
}

#[test]
fn query_with_field_selector() {
    let body =
        query_body(0, "shop.orders", 0, 1, &doc! { "id": 1 }, Some(&doc! { "name": 1 }));
    parse_request(Opcode::Query, &body).expect("field selector is allowed");
}

#[test]
fn query_trailing_garbage_rejected() {
    let mut body = query_body(0, "shop.orders", 0, 1, &doc! {}, Some(&doc! {}));
    body.push(0);
    let err = parse_request(Opcode::Query, &body).expect_err("must reject");
    assert!(matches!(err, ProxyError::Parse(_)));
}

#[test]
fn get_more_extracts_cursor() {
    let body = get_more_body("shop.orders", 100, 0x1234);
    let req = parse_request(Opcode::GetMore, &body).expect("get_more parses");
    assert_eq!(req.cursor_id(), Some(0x1234));
    assert!(req.shard_key().is_none());
}

#[test]
fn delete_extracts_selector() {
    let selector = doc! { "id": 3 };
    let body = delete_body("shop.orders", 0, &selector);
    let req = parse_request(Opcode::Delete, &body).expect("delete parses");
    assert_eq!(req.shard_key(), Some(&selector));
}

#[test]
fn namespace_must_have_db_and_collection() {
    for bad in ["orders", ".orders", "shop."] {
        let body = query_body(0, bad, 0, 1, &doc! {}, None);
        assert!(
            parse_request(Opcode::Query, &body).is_err(),
            "namespace {bad:?} must be rejected"
        );
    }
}

// The namespace terminator is NUL; an embedded newline is payload, not a
// delimiter.
#[test]
fn namespace_with_newline_byte() {
    let ns = "shop.or\nders";
    let body = get_more_body(ns, 1, 5);
    let req = parse_request(Opcode::GetMore, &body).expect("parses");
    assert_eq!(req.ns, ns);
}

#[test]
fn truncated_document_rejected() {
    let mut body = insert_body(0, "shop.orders", &[doc! { "id": 1 }]);
    body.truncate(body.len() - 3);
    assert!(parse_request(Opcode::Insert, &body).is_err());
}

#[test]
fn unsupported_opcodes_rejected() {
    for op in [Opcode::Msg, Opcode::KillCursors, Opcode::Reserved, Opcode::Reply] {
        let err = parse_request(op, &[]).expect_err("must reject");
        assert!(
            matches!(err, ProxyError::UnsupportedOpcode(_)),
            "{op:?} got {err:?}"
        );
    }
    assert!(Opcode::from_i32(9999).is_none());
}

// OP_QUERY body of a `{getLastError: 1}` probe on shop.$cmd, as captured
// off the wire.
#[test]
fn parses_wire_capture_of_gle_probe() {
    let body = hex!(
        "00000000"                   // flags
        "73686f702e24636d6400"       // "shop.$cmd\0"
        "00000000"                   // numberToSkip
        "01000000"                   // numberToReturn
        "17000000"                   // document length = 23
        "106765744c6173744572726f7200 01000000" // int32 getLastError: 1
        "00"
    );

    let req = parse_request(Opcode::Query, &body).expect("capture parses");
    assert_eq!(req.ns, "shop.$cmd");
    match &req.op {
        RequestOp::Query { query, .. } => {
            assert_eq!(query.get_i32("getLastError"), Ok(1));
        },
        other => panic!("unexpected op {other:?}"),
    }
}

#[test]
fn cmd_ns_takes_db_prefix() {
    assert_eq!(cmd_ns("shop.orders"), "shop.$cmd");
    assert_eq!(cmd_ns("a.b.c"), "a.$cmd");
}
