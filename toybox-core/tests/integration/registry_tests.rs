// tests/integration/registry_tests.rs

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use toybox_core::commands::CommandRegistry;
use toybox_core::models::{CommandDefinition, CommandParam, ParamType};
use toybox_core::sync::LocalChannel;
use toybox_core::traits::SyncChannel;
use toybox_core::Error;

fn defaults() -> Vec<CommandDefinition> {
    vec![
        CommandDefinition::new("buddy", "pat").with_cooldown(5),
        CommandDefinition::new("buddy", "hug").members_only(),
    ]
}

#[test]
fn test_edits_survive_restart_through_snapshot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::with_snapshot(&path).unwrap());
        let registry = CommandRegistry::new(channel);
        registry.reconcile(defaults(), "buddy");
        registry
            .update("buddy__pat", |d| {
                d.command = "headpat".into();
                d.cool_down = 30;
            })
            .unwrap();
    }

    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::with_snapshot(&path).unwrap());
    let registry = CommandRegistry::new(channel);
    let effective = registry.reconcile(defaults(), "buddy");

    let pat = effective.iter().find(|d| d.slug == "buddy__pat").unwrap();
    assert_eq!(pat.command, "headpat");
    assert_eq!(pat.cool_down, 30);
    assert!(registry.lookup("pat").is_none());
    assert_eq!(registry.lookup("headpat").unwrap().slug, "buddy__pat");
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_unknown_fields_are_kept() {
    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let registry = CommandRegistry::new(channel);
    let imported = json!({
        "buddy__pat": {
            "command": "pat",
            "slug": "buddy__pat",
            "coolDown": 5,
            "soundVolume": 0.4
        }
    });
    assert_eq!(registry.import_json(&imported.to_string()).unwrap(), 1);

    registry.reconcile(defaults(), "buddy");
    registry.set_enabled("buddy__pat", false).unwrap();

    let exported: serde_json::Value = serde_json::from_str(&registry.export_json().unwrap()).unwrap();
    assert_eq!(exported["buddy__pat"]["soundVolume"], json!(0.4));
    assert_eq!(exported["buddy__pat"]["enabled"], json!(false));
    assert_eq!(exported["buddy__hug"]["memberOnly"], json!(true));
}

#[test]
fn test_unknown_param_fields_are_kept() {
    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let registry = CommandRegistry::new(channel);
    let imported = json!({
        "buddy__pat": {
            "command": "pat",
            "slug": "buddy__pat",
            "params": [{ "name": "target", "type": "username", "optional": true, "description": "who" }]
        }
    });
    registry.import_json(&imported.to_string()).unwrap();
    registry
        .update("buddy__pat", |d| d.cool_down = 9)
        .unwrap();

    let exported: serde_json::Value = serde_json::from_str(&registry.export_json().unwrap()).unwrap();
    let param = &exported["buddy__pat"]["params"][0];
    assert_eq!(param["description"], json!("who"));
    assert_eq!(param["type"], json!("username"));
    assert_eq!(exported["buddy__pat"]["coolDown"], json!(9));
}

#[test]
fn test_import_rejects_mismatched_slug() {
    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let registry = CommandRegistry::new(channel);
    let bad = json!({ "a__x": { "command": "x", "slug": "b__x" } });
    assert!(matches!(registry.import_json(&bad.to_string()), Err(Error::Parse(_))));
    assert!(registry.is_empty());
}

#[test]
fn test_remote_edit_reindexes_other_process() {
    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let bot = CommandRegistry::new(channel.clone());
    let editor = CommandRegistry::new(channel);

    bot.reconcile(defaults(), "buddy");
    assert_eq!(editor.len(), 2);

    editor.update("buddy__hug", |d| d.command = "squeeze".into()).unwrap();
    assert_eq!(bot.lookup("squeeze").unwrap().slug, "buddy__hug");
    assert!(bot.lookup("hug").is_none());

    let clash = editor.update("buddy__hug", |d| d.command = "pat".into());
    assert!(matches!(clash, Err(Error::Conflict(_))));
    assert_eq!(bot.lookup("pat").unwrap().slug, "buddy__pat");
}

#[test]
fn test_changed_defaults_do_not_override_stored_params() {
    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let registry = CommandRegistry::new(channel);
    registry.reconcile(defaults(), "buddy");

    let newer = vec![
        CommandDefinition::new("buddy", "pat")
            .with_param(CommandParam::required("target", ParamType::Username)),
    ];
    let effective = registry.reconcile(newer, "buddy");
    assert!(effective[0].params.is_empty());
    assert_eq!(registry.commands_for("buddy").len(), 2);
}

#[test]
fn test_disposed_registry_stops_following() {
    let channel: Arc<dyn SyncChannel> = Arc::new(LocalChannel::in_memory());
    let a = CommandRegistry::new(channel.clone());
    let b = CommandRegistry::new(channel);
    a.reconcile(defaults(), "buddy");

    b.dispose();
    a.update("buddy__pat", |d| d.command = "boop".into()).unwrap();
    assert!(b.lookup("boop").is_none());
    assert!(b.remove("buddy__hug").is_some());
    assert!(a.get("buddy__hug").is_some());
}
