use bson::{Document, doc};
use mongo_proxy_rs::protocol::{
    gle::{GLE_KEY, build_get_last_error, synth_gle_reply},
    header::{HEADER_LEN, MsgHeader, ReplyPrefix},
    opcode::Opcode,
    request::{RequestOp, parse_request},
};

#[test]
fn follow_up_query_layout() {
    let wire = build_get_last_error("shop.$cmd", 41);

    let header_bytes: [u8; HEADER_LEN] =
        wire[..HEADER_LEN].try_into().expect("header slice");
    let header = MsgHeader::parse(&header_bytes);
    assert_eq!(header.message_length.get() as usize, wire.len());
    assert_eq!(header.request_id.get(), 42);
    assert_eq!(header.response_to.get(), 0);
    assert_eq!(header.opcode().expect("opcode"), Opcode::Query);

    // The body must parse as a regular query on the command namespace.
    let req = parse_request(Opcode::Query, &wire[HEADER_LEN..]).expect("body parses");
    assert_eq!(req.ns, "shop.$cmd");
    assert_eq!(req.flags, 0);
    match &req.op {
        RequestOp::Query {
            skip,
            n_return,
            query,
        } => {
            assert_eq!(*skip, 0);
            assert_eq!(*n_return, 1);
            assert!(query.contains_key(GLE_KEY));
            assert_eq!(query.get_bool("j"), Ok(true));
        },
        other => panic!("unexpected op {other:?}"),
    }
}

#[test]
fn follow_up_request_id_wraps() {
    let wire = build_get_last_error("db.$cmd", i32::MAX);
    let header_bytes: [u8; HEADER_LEN] =
        wire[..HEADER_LEN].try_into().expect("header slice");
    assert_eq!(MsgHeader::parse(&header_bytes).request_id.get(), i32::MIN);
}

// The command body is marshalled once; its bytes are part of the wire
// contract with upstreams.
#[test]
fn gle_body_bytes_are_stable() {
    let wire = build_get_last_error("shop.$cmd", 0);
    let body = &wire[wire.len() - 27..];
    assert_eq!(
        hex::encode(body),
        "1b000000106765744c6173744572726f720001000000086a000100"
    );
}

#[test]
fn synthesized_reply_reports_success() {
    let (header_bytes, body) = synth_gle_reply(99);

    let header = MsgHeader::parse(&header_bytes);
    assert_eq!(header.opcode().expect("opcode"), Opcode::Reply);
    assert_eq!(header.response_to.get(), 99);
    assert_eq!(
        header.message_length.get() as usize,
        HEADER_LEN + body.len()
    );

    let prefix = ReplyPrefix::parse(&body).expect("prefix");
    assert_eq!(prefix.cursor_id.get(), 0);
    assert_eq!(prefix.number_returned.get(), 1);

    let doc = Document::from_reader(&body[20..]).expect("ok document");
    assert_eq!(doc, doc! { "ok": 1.0 });
}

#[test]
fn synthesized_reply_is_deterministic() {
    assert_eq!(synth_gle_reply(7), synth_gle_reply(7));
}
