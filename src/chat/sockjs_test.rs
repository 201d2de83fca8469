use super::*;

#[test]
fn session_url_has_server_and_session_segments() {
    let url = session_url("http://chat.test/ws/");
    let rest = url.strip_prefix("ws://chat.test/ws/").expect("ws scheme and base kept");
    let segments = rest.split('/').collect::<Vec<_>>();

    assert_eq!(segments.len(), 3);
    assert_eq!(segments[0].len(), 3);
    assert!(segments[0].chars().all(|c| c.is_ascii_digit()));
    assert_eq!(segments[1].len(), SESSION_ID_LEN);
    assert!(segments[1].chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(segments[2], "websocket");
}

#[test]
fn session_url_switches_https_to_wss() {
    assert!(session_url("https://chat.test/ws").starts_with("wss://chat.test/ws/"));
}

#[test]
fn open_and_heartbeat_frames() {
    assert_eq!(decode_frame("o"), vec![TransportEvent::Open]);
    assert!(decode_frame("h").is_empty());
    assert!(decode_frame("").is_empty());
}

#[test]
fn array_frame_yields_each_message() {
    let events = decode_frame(r#"a["CONNECTED\nversion:1.2\n\n\u0000","MESSAGE\n\n\u0000"]"#);
    assert_eq!(
        events,
        vec![
            TransportEvent::Text("CONNECTED\nversion:1.2\n\n\0".to_owned()),
            TransportEvent::Text("MESSAGE\n\n\0".to_owned()),
        ]
    );
}

#[test]
fn single_message_frame() {
    assert_eq!(
        decode_frame(r#"m"hello""#),
        vec![TransportEvent::Text("hello".to_owned())]
    );
}

#[test]
fn close_frame_carries_code_and_reason() {
    assert_eq!(
        decode_frame(r#"c[3000,"Go away!"]"#),
        vec![TransportEvent::Closed {
            code: Some(3000),
            reason: "Go away!".to_owned(),
        }]
    );
}

#[test]
fn malformed_frames_become_errors() {
    assert!(matches!(
        decode_frame("a[broken").as_slice(),
        [TransportEvent::Error(_)]
    ));
    assert!(matches!(
        decode_frame("x").as_slice(),
        [TransportEvent::Error(_)]
    ));
    assert!(matches!(
        decode_frame("c{}").as_slice(),
        [TransportEvent::Error(_), TransportEvent::Closed { code: None, .. }]
    ));
}

#[test]
fn outbound_messages_are_json_string_arrays() {
    let encoded = encode_messages(&["SEND\ndestination:/app/chat.send\n\n{}\0".to_owned()]).expect("encode");
    assert_eq!(encoded, r#"["SEND\ndestination:/app/chat.send\n\n{}\u0000"]"#);
}
