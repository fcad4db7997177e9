use std::path::Path;
use tsp_firmware::config::{ProtocolConfig, SessionConfig};
use tsp_firmware::firmware::FirmwareManager;
use tsp_firmware::script::{FirmwareScript, ScriptEntity};
use tsp_firmware::session::{syntax, MockInstrument, TspSession};
use tsp_firmware::subsystem::ExecutionState;
use tsp_firmware::TspError;

fn manager(mock: &MockInstrument, config: ProtocolConfig) -> FirmwareManager {
    FirmwareManager::new(
        TspSession::new(mock.clone(), SessionConfig::immediate()),
        config,
    )
}

fn script_file(dir: &Path, name: &str, text: &str) -> ScriptEntity {
    let file_name = format!("{name}.tsp");
    std::fs::write(dir.join(&file_name), text).unwrap();
    ScriptEntity::new(FirmwareScript::new(name, &file_name, dir), 1)
}

#[tokio::test]
async fn test_load_three_line_file() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockInstrument::new();
    let manager = manager(&mock, ProtocolConfig::immediate());
    let mut foo = script_file(dir.path(), "foo", "-- comment\nprint(1)\n\n");

    assert!(manager.load_script(&mut foo, false, false).await.unwrap());
    assert!(foo.loaded);

    assert_eq!(
        mock.writes(),
        vec![
            syntax::SHOW_PROMPTS_QUERY.to_string(),
            syntax::SHOW_ERRORS_QUERY.to_string(),
            "loadscript foo ".to_string(),
            "print(1) ".to_string(),
            syntax::end_script_command(),
        ]
    );
    assert_eq!(mock.script(1, "foo").unwrap().body, vec!["print(1)"]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("foo.trimmed.tsp")).unwrap(),
        "print(1)\n"
    );
}

#[tokio::test]
async fn test_missing_file_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockInstrument::new();
    let manager = manager(&mock, ProtocolConfig::immediate());
    let mut missing = ScriptEntity::new(FirmwareScript::new("foo", "foo.tsp", dir.path()), 1);

    let err = manager
        .load_script(&mut missing, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, TspError::FileNotFound(_)));
    assert!(mock.writes().is_empty());
}

#[tokio::test]
async fn test_blank_name_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockInstrument::new();
    let manager = manager(&mock, ProtocolConfig::immediate());
    let mut blank = script_file(dir.path(), "foo", "print(1)\n");
    blank.script.name = "  ".to_string();

    let err = manager.load_script(&mut blank, false, false).await.unwrap_err();
    assert!(matches!(err, TspError::InvalidArgument(_)));
    assert!(mock.writes().is_empty());
}

#[tokio::test]
async fn test_error_on_first_line_skips_endscript() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockInstrument::new();
    mock.fail_on("print(1)");
    let manager = manager(&mock, ProtocolConfig::immediate());
    let mut foo = script_file(dir.path(), "foo", "print(1)\nprint(2)\n");

    let err = manager.load_script(&mut foo, false, false).await.unwrap_err();
    match &err {
        TspError::InvalidOperation {
            execution_state, ..
        } => assert_eq!(*execution_state, ExecutionState::IdleError),
        other => panic!("unexpected error {other}"),
    }
    assert!(err.to_string().contains("-285"));

    let writes = mock.writes();
    assert!(writes.contains(&"print(1) ".to_string()));
    assert!(!writes.contains(&"print(2) ".to_string()));
    assert!(!writes.iter().any(|w| w.starts_with("endscript")));
    assert!(!foo.loaded);
    assert!(!dir.path().join("foo.trimmed.tsp").exists());
}

#[tokio::test]
async fn test_block_comments_are_not_sent() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockInstrument::new();
    let manager = manager(&mock, ProtocolConfig::immediate());
    let text = "--[[\n  header\n]]\nx = 1 -- trailing\n\ty = 2\n";
    let mut foo = script_file(dir.path(), "foo", text);

    manager.load_script(&mut foo, false, false).await.unwrap();
    assert_eq!(mock.script(1, "foo").unwrap().body, vec!["x = 1", "y = 2"]);
}

#[tokio::test]
async fn test_existing_trimmed_copy_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockInstrument::new();
    let mut foo = script_file(dir.path(), "foo", "print(1)\n");
    let trimmed = dir.path().join("foo.trimmed.tsp");
    std::fs::write(&trimmed, "keep\n").unwrap();

    manager(&mock, ProtocolConfig::immediate())
        .load_script(&mut foo, false, false)
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(&trimmed).unwrap(), "keep\n");

    let overwrite = ProtocolConfig {
        overwrite_trimmed: true,
        ..ProtocolConfig::immediate()
    };
    manager(&mock, overwrite)
        .load_script(&mut foo, false, false)
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(&trimmed).unwrap(), "print(1)\n");
}

#[tokio::test]
async fn test_interactive_settings_restored() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockInstrument::new();
    mock.set_prompts(true);
    let manager = manager(&mock, ProtocolConfig::immediate());
    let mut foo = script_file(dir.path(), "foo", "print(1)\n");

    assert!(manager.load_script(&mut foo, true, false).await.unwrap());

    let writes = mock.writes();
    assert!(writes.contains(&syntax::show_prompts_command(false)));
    assert!(writes.contains(&syntax::show_errors_command(true)));
    assert!(writes.ends_with(&[
        syntax::show_errors_command(false),
        syntax::show_prompts_command(true),
    ]));
    assert!(manager.session().prompts_enabled());
    assert_eq!(mock.pending_output(), 0);
}

#[tokio::test]
async fn test_leveled_and_inline_block_comments() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockInstrument::new();
    let manager = manager(&mock, ProtocolConfig::immediate());
    let text = "--[==[\nprint('skip')\n]]\n]==]\n--[[ note ]] x = 1\ny = 2 --[=[ a ]=] z = 3\n";
    let mut foo = script_file(dir.path(), "foo", text);

    manager.load_script(&mut foo, false, false).await.unwrap();
    assert_eq!(
        mock.script(1, "foo").unwrap().body,
        vec!["x = 1", "y = 2  z = 3"]
    );
    assert!(!mock.writes().iter().any(|w| w.contains("skip")));
}
