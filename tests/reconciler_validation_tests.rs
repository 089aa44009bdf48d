//! Integration tests for reconciler validation logic and resource shapes
//!
//! These tests verify that the validation functions for each CRD type
//! correctly accept valid specs and reject invalid ones.

use pachyderm_backup_operator::crd::{
    BackupOptions, JobPhase, PachydermExport, PachydermExportSpec, PachydermImport,
    PachydermImportSpec, RestoreDestination,
};
use pachyderm_backup_operator::reconcilers::{export, import};
use pachyderm_backup_operator::Error;

// ============================================================================
// Test Helpers
// ============================================================================

fn valid_export() -> PachydermExport {
    let mut export = PachydermExport::new(
        "nightly",
        PachydermExportSpec {
            backup: Some(BackupOptions {
                target: "pachyderm".to_string(),
            }),
            storage_secret: "backup-creds".to_string(),
        },
    );
    export.metadata.namespace = Some("ml".to_string());
    export
}

fn valid_import() -> PachydermImport {
    let mut import = PachydermImport::new(
        "restore-1",
        PachydermImportSpec {
            destination: RestoreDestination {
                name: "pachyderm-restored".to_string(),
                namespace: None,
            },
            backup_name: "/tmp/nightly-202401021504.sql.gz".to_string(),
            storage_secret: "backup-creds".to_string(),
        },
    );
    import.metadata.namespace = Some("ml".to_string());
    import
}

// ============================================================================
// PachydermExport
// ============================================================================

#[test]
fn test_valid_export_passes() {
    assert!(export::validate(&valid_export()).is_ok());
}

#[test]
fn test_export_without_storage_secret_fails() {
    let mut export = valid_export();
    export.spec.storage_secret = "  ".to_string();
    let err = export::validate(&export).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains("storageSecret"));
}

#[test]
fn test_export_without_target_fails() {
    let mut export = valid_export();
    export.spec.backup = None;
    assert!(matches!(export::validate(&export), Err(Error::Validation(_))));

    let mut export = valid_export();
    export.spec.backup = Some(BackupOptions {
        target: String::new(),
    });
    assert!(export::validate(&export).is_err());
}

#[test]
fn test_export_phase_is_read_from_status() {
    let mut export = valid_export();
    assert_eq!(export::current_phase(&export), None);

    export.status = serde_json::from_value(serde_json::json!({
        "phase": "Running",
        "backupID": "0b8b4c1e-54e5-4c55-9d1a-6f9f7e3c2d10"
    }))
    .unwrap();
    assert_eq!(export::current_phase(&export), Some(JobPhase::Running));
    assert_eq!(
        export.status.unwrap().backup_id.as_deref(),
        Some("0b8b4c1e-54e5-4c55-9d1a-6f9f7e3c2d10")
    );
}

#[test]
fn test_dump_command_cleans_before_create() {
    let command = export::dump_command();
    assert_eq!(command[0], "pg_dumpall");
    assert!(command.iter().any(|arg| arg == "--clean"));
}

// ============================================================================
// PachydermImport
// ============================================================================

#[test]
fn test_valid_import_passes() {
    assert!(import::validate(&valid_import()).is_ok());
}

#[test]
fn test_import_requires_backup_destination_and_secret() {
    let mut missing_backup = valid_import();
    missing_backup.spec.backup_name = String::new();
    assert!(matches!(
        import::validate(&missing_backup),
        Err(Error::Validation(_))
    ));

    let mut missing_destination = valid_import();
    missing_destination.spec.destination.name = String::new();
    assert!(import::validate(&missing_destination).is_err());

    let mut missing_secret = valid_import();
    missing_secret.spec.storage_secret = String::new();
    assert!(import::validate(&missing_secret).is_err());
}

#[test]
fn test_import_destination_namespace_defaults_to_own_namespace() {
    let mut import = valid_import();
    assert_eq!(import::destination_namespace(&import), "ml");

    import.spec.destination.namespace = Some("staging".to_string());
    assert_eq!(import::destination_namespace(&import), "staging");
}

#[test]
fn test_import_spec_uses_backup_field_name() {
    let spec: PachydermImportSpec = serde_json::from_value(serde_json::json!({
        "destination": { "name": "pachyderm-restored" },
        "backup": "/tmp/nightly-202401021504.sql.gz",
        "storageSecret": "backup-creds"
    }))
    .unwrap();
    assert_eq!(spec.backup_name, "/tmp/nightly-202401021504.sql.gz");
    assert_eq!(spec.storage_secret, "backup-creds");

    let value = serde_json::to_value(&spec).unwrap();
    assert!(value.get("backup").is_some());
    assert!(value.get("backupName").is_none());
}

#[test]
fn test_terminal_import_phases_are_not_repolled() {
    let mut import = valid_import();
    import.status = serde_json::from_value(serde_json::json!({ "phase": "NotFound" })).unwrap();
    assert!(import::current_phase(&import).is_some_and(|p| p.is_terminal()));
}
