use tsp_firmware::config::{ProtocolConfig, SessionConfig};
use tsp_firmware::firmware::FirmwareManager;
use tsp_firmware::node::NodeEntity;
use tsp_firmware::script::{FirmwareScript, ScriptEntityCollection};
use tsp_firmware::session::{syntax, MockInstrument, TspSession};

fn manager(mock: &MockInstrument) -> FirmwareManager {
    FirmwareManager::new(
        TspSession::new(mock.clone(), SessionConfig::immediate()),
        ProtocolConfig::immediate(),
    )
}

fn script(name: &str, boot: bool, byte_code: bool) -> FirmwareScript {
    let mut script = FirmwareScript::new(name, &format!("{name}.tsp"), "/fw");
    script.is_boot_script = boot;
    script.convert_to_byte_code = byte_code;
    script
}

#[tokio::test]
async fn test_save_then_read_state_round_trip() {
    let mock = MockInstrument::new();
    mock.add_script(1, "lib", &["x = 1"], false);
    mock.add_script(1, "boot", &["y = 1"], false);
    let manager = manager(&mock);
    let mut node = NodeEntity::controller(1, "2612B");
    let mut scripts =
        ScriptEntityCollection::from_scripts(1, [script("boot", true, false), script("lib", false, false)]);

    let outcome = manager.save_user_scripts(&mut scripts, &mut node).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.reset, None);
    let order: Vec<&str> = outcome.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(order, vec!["lib", "boot"]);
    assert!(scripts.all_saved());
    assert!(!node.boot_script_save_required);

    manager.read_scripts_state(&mut scripts, &node).await.unwrap();
    assert!(scripts.all_saved());
    assert!(mock.script(1, "boot").unwrap().autorun);
}

#[tokio::test]
async fn test_boot_script_runs_after_successful_save() {
    let mock = MockInstrument::new();
    mock.add_script(1, "lib", &["x = 1"], false);
    mock.add_script(1, "boot", &["isr = {}"], true);
    let manager = manager(&mock);
    let mut node = NodeEntity::controller(1, "2612B");
    let mut scripts =
        ScriptEntityCollection::from_scripts(1, [script("lib", false, false), script("boot", true, false)]);

    let outcome = manager.save_user_scripts(&mut scripts, &mut node).await.unwrap();

    assert!(outcome.success);
    // saving lib requires the boot script to be saved again
    let order: Vec<&str> = outcome.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(order, vec!["lib", "boot"]);
    let writes = mock.writes();
    let save = writes
        .iter()
        .position(|w| *w == syntax::save_command("boot", true))
        .unwrap();
    let run = writes
        .iter()
        .position(|w| *w == syntax::run_script_command("boot"))
        .unwrap();
    assert!(save < run);
    assert!(mock.is_defined(1, "isr"));
}

#[tokio::test]
async fn test_failed_save_skips_boot_run() {
    let mock = MockInstrument::new();
    mock.add_script(1, "lib", &["x = 1"], false);
    mock.add_script(1, "boot", &["y = 1"], false);
    mock.fail_on("lib.save()");
    let manager = manager(&mock);
    let mut node = NodeEntity::controller(1, "2612B");
    let mut scripts =
        ScriptEntityCollection::from_scripts(1, [script("lib", false, false), script("boot", true, false)]);

    let outcome = manager.save_user_scripts(&mut scripts, &mut node).await.unwrap();

    assert!(!outcome.success);
    let failures: Vec<&str> = outcome.failures().map(|i| i.name.as_str()).collect();
    assert_eq!(failures, vec!["lib"]);
    assert!(!mock
        .writes()
        .contains(&syntax::run_script_command("boot")));
    assert!(!scripts.get("lib").unwrap().saved);
    assert!(scripts.get("boot").unwrap().saved);
}

#[tokio::test]
async fn test_byte_code_conversion_resets_remote_node() {
    let mock = MockInstrument::new();
    mock.add_node(2, "2612B");
    mock.add_script(2, "lib", &["x = 1"], false);
    let manager = manager(&mock);
    let mut node = NodeEntity::new(2, 1, "2612B", None);
    let mut scripts = ScriptEntityCollection::from_scripts(2, [script("lib", false, true)]);

    let outcome = manager.save_user_scripts(&mut scripts, &mut node).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.reset, Some(true));
    assert_eq!(mock.resets(), 1);
    let lib = mock.script(2, "lib").unwrap();
    assert!(lib.byte_code && lib.saved);
    assert!(mock
        .writes()
        .contains(&syntax::nil_source_on_node_command(2, "lib")));
    assert_eq!(manager.session().last_node_number(), None);
}

#[tokio::test]
async fn test_already_saved_scripts_are_skipped() {
    let mock = MockInstrument::new();
    mock.add_script(1, "lib", &["x = 1"], true);
    let manager = manager(&mock);
    let mut node = NodeEntity::controller(1, "2612B");
    let mut scripts = ScriptEntityCollection::from_scripts(1, [script("lib", false, false)]);

    let outcome = manager.save_user_scripts(&mut scripts, &mut node).await.unwrap();

    assert!(outcome.success);
    assert!(outcome.items.is_empty());
    assert!(!mock.writes().iter().any(|w| w.contains(".save()")));
}

#[tokio::test]
async fn test_nil_object_already_nil_writes_no_assignment() {
    let mock = MockInstrument::new();
    let manager = manager(&mock);

    manager.nill_object("foo").await.unwrap();

    assert_eq!(mock.writes(), vec![syntax::is_nil_query("foo")]);
    assert!(!mock.writes().contains(&syntax::nil_command("foo")));
}

#[tokio::test]
async fn test_nil_object_on_remote_node() {
    let mock = MockInstrument::new();
    mock.add_node(2, "2612B");
    mock.define(2, "foo");
    let manager = manager(&mock);
    let node = NodeEntity::new(2, 1, "2612B", None);

    manager.nill_object_on_node(&node, "foo").await.unwrap();

    assert!(!mock.is_defined(2, "foo"));
    assert!(mock.writes().contains(&syntax::nil_on_node_command(2, "foo")));
}
