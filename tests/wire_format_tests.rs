use chrono::{TimeZone, Utc};
use interview_rtc::recording::Artifact;
use interview_rtc::signaling::{
    IceCandidate, InboundFrame, OutboundFrame, RelayReply, Role, SignalPayload,
};
use interview_rtc::signaling::messages::{JoinRequest, LeaveNotice};

#[test]
fn test_join_request_frame() {
    let frame = OutboundFrame::Join(JoinRequest {
        room_id: "room-1".to_string(),
        interview_id: "iv-1".to_string(),
        identity: "candidate-token".to_string(),
    });

    let json = serde_json::to_string(&frame).unwrap();
    assert!(json.contains("\"type\":\"join\""));
    assert!(json.contains("\"roomId\":\"room-1\""));
    assert!(json.contains("\"interviewId\":\"iv-1\""));
    assert_eq!(frame.subject_leaf(), "join");
    assert_eq!(frame.room_id(), "room-1");

    let leave = OutboundFrame::Leave(LeaveNotice {
        room_id: "room-1".to_string(),
        identity: "candidate-token".to_string(),
    });
    assert!(serde_json::to_string(&leave)
        .unwrap()
        .contains("\"type\":\"leave\""));
}

#[test]
fn test_relay_replies() {
    let joined: RelayReply = serde_json::from_str(
        r#"{"type":"joined","roomId":"room-1","role":"answerer","roster":["recruiter"]}"#,
    )
    .unwrap();
    match joined {
        RelayReply::Joined(response) => {
            assert_eq!(response.role, Role::Answerer);
            assert_eq!(response.roster, vec!["recruiter".to_string()]);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    // Roster is optional for the first participant
    let joined: RelayReply =
        serde_json::from_str(r#"{"type":"joined","roomId":"room-1","role":"offerer"}"#).unwrap();
    assert!(matches!(joined, RelayReply::Joined(r) if r.roster.is_empty()));

    let delivered: RelayReply = serde_json::from_str(
        r#"{"type":"delivered","messageId":"m-7","deliveredAt":"2025-10-27T14:30:00Z"}"#,
    )
    .unwrap();
    assert!(matches!(delivered, RelayReply::Delivered(ack) if ack.message_id == "m-7"));

    let rejected: RelayReply =
        serde_json::from_str(r#"{"type":"rejected","reason":"room is full"}"#).unwrap();
    assert_eq!(
        rejected,
        RelayReply::Rejected {
            reason: "room is full".to_string()
        }
    );
}

#[test]
fn test_presence_frame() {
    let frame: InboundFrame = serde_json::from_str(
        r#"{"type":"presence","roomId":"room-1","peer":"recruiter","joined":false}"#,
    )
    .unwrap();

    match frame {
        InboundFrame::Presence(update) => {
            assert_eq!(update.peer, "recruiter");
            assert!(!update.joined);
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[test]
fn test_browser_candidate_without_optional_fields() {
    let payload: SignalPayload = serde_json::from_str(
        r#"{"type":"candidate","candidate":"candidate:1 1 udp 1 10.0.0.2 50000 typ host"}"#,
    )
    .unwrap();

    assert_eq!(
        payload,
        SignalPayload::Candidate(IceCandidate::new(
            "candidate:1 1 udp 1 10.0.0.2 50000 typ host"
        ))
    );

    let payload: SignalPayload = serde_json::from_str(
        r#"{"type":"candidate","candidate":"c","sdpMid":"1","sdpMLineIndex":1,"usernameFragment":"abcd"}"#,
    )
    .unwrap();
    match payload {
        SignalPayload::Candidate(candidate) => {
            assert_eq!(candidate.sdp_mline_index, Some(1));
            assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
        }
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[test]
fn test_artifact_metadata() {
    let artifact = Artifact {
        recording_id: "rec-1".to_string(),
        interview_id: Some("iv-1".to_string()),
        bytes: vec![1, 2, 3],
        duration_seconds: 1.25,
        duration_ms: 1250,
        mime_type: "audio/wav".to_string(),
        size_bytes: 3,
        video_frames: 37,
        started_at: Utc.with_ymd_and_hms(2025, 10, 27, 14, 30, 0).unwrap(),
    };

    let json = serde_json::to_value(&artifact).unwrap();
    assert_eq!(json["recordingId"], "rec-1");
    assert_eq!(json["interviewId"], "iv-1");
    assert_eq!(json["durationSeconds"], 1.25);
    assert_eq!(json["durationMs"], 1250);
    assert_eq!(json["sizeBytes"], 3);
    assert_eq!(json["mimeType"], "audio/wav");
    assert!(json.get("bytes").is_none());
    assert_eq!(artifact.extension(), "wav");
}
