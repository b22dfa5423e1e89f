use peerchat_common::protocol::{decode_lines, MAX_FRAME_BYTES};
use peerchat_common::{MessageKind, RelayMessage};
use rand::{thread_rng, Rng};

#[test]
fn fuzz_decode_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..512);
        let data: String = (0..len).map(|_| rng.gen::<char>()).collect();
        let _ = RelayMessage::decode(&data);
    }
}

#[test]
fn random_mutation_of_valid_line_is_handled() {
    let mut rng = thread_rng();
    let line = RelayMessage::offer("s1", "v=0 o=- 46117 2 IN IP4 127.0.0.1")
        .encode_line()
        .unwrap();
    let bytes = line.into_bytes();

    for _ in 0..1_000 {
        let mut mutated = bytes.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] = rng.gen_range(0x20..0x7f);
        }
        if let Ok(text) = String::from_utf8(mutated) {
            if let Ok(msg) = RelayMessage::decode(&text) {
                assert!(msg.validate().is_ok());
            }
        }
    }
}

#[test]
fn oversized_frame_is_rejected() {
    let payload = "x".repeat(MAX_FRAME_BYTES);
    let raw = format!(r#"{{"sessionId":"s1","kind":"offer","payload":"{payload}"}}"#);
    assert!(RelayMessage::decode(&raw).is_err());
}

#[test]
fn stream_of_random_messages_survives_line_codec() {
    let mut rng = thread_rng();
    let kinds = [
        MessageKind::Offer,
        MessageKind::Answer,
        MessageKind::Candidate,
        MessageKind::Bye,
    ];
    let messages: Vec<RelayMessage> = (0..200)
        .map(|i| {
            let kind = kinds[rng.gen_range(0..kinds.len())];
            let len = rng.gen_range(0..64);
            let payload: String = (0..len).map(|_| rng.gen::<char>()).collect();
            RelayMessage::new(format!("session-{i}"), kind, payload)
        })
        .collect();

    let stream: String = messages
        .iter()
        .map(|m| m.encode_line().unwrap())
        .collect();
    let decoded: Vec<RelayMessage> = decode_lines(&stream).map(|r| r.unwrap()).collect();
    assert_eq!(decoded, messages);
}
