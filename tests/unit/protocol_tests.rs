use agent_conductor::ipc::protocol::{CommandInput, IpcRequest, IpcResponse, ServerLine};
use agent_conductor::models::command_queue::{QueueStatus, SessionMode};
use agent_conductor::AppError;

#[test]
fn create_group_accepts_spec_list() {
    let raw = r#"{
        "command": "create_group",
        "name": "build",
        "max_concurrent": 2,
        "specs": [
            {"id": "a", "project_path": "/tmp/p", "prompt": "first"},
            {"id": "b", "project_path": "/tmp/p", "prompt": "second", "depends_on": ["a"]}
        ]
    }"#;
    match serde_json::from_str::<IpcRequest>(raw).expect("request") {
        IpcRequest::CreateGroup {
            name,
            max_concurrent,
            specs,
        } => {
            assert_eq!(name, "build");
            assert_eq!(max_concurrent, Some(2));
            assert_eq!(specs.len(), 2);
            assert!(specs[1].depends_on.contains("a"));
        }
        other => panic!("unexpected request {other:?}"),
    }
}

#[test]
fn list_queues_status_is_optional() {
    let bare: IpcRequest = serde_json::from_str(r#"{"command":"list_queues"}"#).expect("bare");
    assert_eq!(bare, IpcRequest::ListQueues { status: None });
    let filtered: IpcRequest =
        serde_json::from_str(r#"{"command":"list_queues","status":"paused"}"#).expect("filtered");
    assert_eq!(
        filtered,
        IpcRequest::ListQueues {
            status: Some(QueueStatus::Paused)
        }
    );
}

#[test]
fn unknown_command_is_rejected() {
    assert!(serde_json::from_str::<IpcRequest>(r#"{"command":"reboot"}"#).is_err());
}

#[test]
fn verbs_match_wire_tags() {
    let requests = [
        IpcRequest::PauseGroup {
            group_id: "g".into(),
        },
        IpcRequest::StopQueue {
            queue_id: "q".into(),
        },
        IpcRequest::Subscribe {
            session_id: "s".into(),
            include_existing: Some(true),
        },
    ];
    for request in requests {
        let value = serde_json::to_value(&request).expect("json");
        assert_eq!(value["command"], request.verb());
    }
}

#[test]
fn command_input_keeps_mode_and_budget() {
    let input: CommandInput = serde_json::from_str(
        r#"{"prompt":"again","session_mode":"continue","budget":{"max_turns":3}}"#,
    )
    .expect("input");
    let command = input.into_command();
    assert_eq!(command.session_mode, SessionMode::Continue);
    assert_eq!(command.budget.and_then(|b| b.max_turns), Some(3));
    assert!(!command.id.is_empty());
}

#[test]
fn error_response_carries_kind() {
    let response = IpcResponse::from_error(&AppError::QueueNotFound("q-9".into()));
    let json = serde_json::to_value(&response).expect("json");
    assert_eq!(json["ok"], false);
    assert_eq!(json["kind"], "queue_not_found");
    assert!(matches!(response.into_result(), Err(AppError::NotFound(_))));
}

#[test]
fn other_failures_map_to_ipc_errors() {
    let response = IpcResponse::from_error(&AppError::Validation("bad".into()));
    assert!(matches!(response.into_result(), Err(AppError::Ipc(msg)) if msg.contains("bad")));
}

#[test]
fn success_without_data_is_null() {
    let line: ServerLine = serde_json::from_str(r#"{"ok":true}"#).expect("line");
    match line {
        ServerLine::Response(response) => {
            assert_eq!(response.into_result().expect("ok"), serde_json::Value::Null);
        }
        ServerLine::Push(_) => panic!("expected response"),
    }
}

#[test]
fn add_command_carries_its_input_beside_the_tag() {
    let raw = r#"{"command":"add_command","queue_id":"q-1","input":{"prompt":"next","session_mode":"continue"}}"#;
    let request: IpcRequest = serde_json::from_str(raw).expect("request");
    match &request {
        IpcRequest::AddCommand { queue_id, input } => {
            assert_eq!(queue_id, "q-1");
            assert_eq!(input.prompt, "next");
            assert_eq!(input.session_mode, SessionMode::Continue);
        }
        other => panic!("unexpected request {other:?}"),
    }

    let encoded = serde_json::to_value(&request).expect("encode");
    assert_eq!(encoded["command"], "add_command");
    assert_eq!(encoded["input"]["prompt"], "next");
}
