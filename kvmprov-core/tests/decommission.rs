//! Integration tests for instance deletion.
//!
//! Rows are deleted and committed before the domain or any file is touched.

mod common;

use common::{create_request, TestHost, OWNER};
use kvmprov_core::{error::ErrorKind, types::DomainState, InstanceStore};
use uuid::Uuid;

#[tokio::test]
async fn test_delete_instance_removes_everything() {
    let host = TestHost::new().await;
    let provisioner = host.provisioner();
    let instance = provisioner.create_instance(&create_request("web-1")).await.unwrap();

    provisioner.delete_instance(&instance.id, Some(OWNER)).await.unwrap();

    assert!(provisioner.get_instance(&instance.id, None).await.unwrap_err().is_not_found());
    assert!(host.state.get_network(&instance.network_id).await.unwrap_err().is_not_found());
    assert!(!host.hypervisor.is_defined(&instance.id));
    assert!(!host.vm_image(&instance.id).exists());
    assert!(!host.cloudinit_iso(&instance.id).exists());
}

#[tokio::test]
async fn test_delete_running_instance_stops_it_first() {
    let host = TestHost::new().await;
    let provisioner = host.provisioner();
    let instance = provisioner.create_instance(&create_request("web-1")).await.unwrap();
    provisioner.start_instance(&instance.id, Some(OWNER)).await.unwrap();

    provisioner.delete_instance(&instance.id, Some(OWNER)).await.unwrap();

    let calls = host.hypervisor.calls();
    let destroy = calls.iter().position(|c| c == &format!("destroy {}", instance.id)).unwrap();
    let undefine = calls.iter().position(|c| c == &format!("undefine {}", instance.id)).unwrap();
    assert!(destroy < undefine);
    assert!(!host.hypervisor.is_defined(&instance.id));
}

#[tokio::test]
async fn test_delete_unknown_instance_is_not_found() {
    let host = TestHost::new().await;
    let provisioner = host.provisioner();
    let instance = provisioner.create_instance(&create_request("web-1")).await.unwrap();
    let calls_before = host.hypervisor.calls();

    let err = provisioner.delete_instance(&Uuid::new_v4(), None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(host.hypervisor.calls(), calls_before);
    assert_eq!(host.instance_files().len(), 2);
    assert!(provisioner.get_instance(&instance.id, None).await.is_ok());
}

#[tokio::test]
async fn test_delete_other_owners_instance_is_not_found() {
    let host = TestHost::new().await;
    let provisioner = host.provisioner();
    let instance = provisioner.create_instance(&create_request("web-1")).await.unwrap();

    let err = provisioner.delete_instance(&instance.id, Some(OWNER + 1)).await.unwrap_err();

    assert!(err.is_not_found());
    assert!(host.hypervisor.is_defined(&instance.id));
    assert!(host.vm_image(&instance.id).exists());
}

#[tokio::test]
async fn test_commit_failure_leaves_domain_and_files() {
    let host = TestHost::new().await;
    let (store, provisioner) = host.failing_provisioner();
    let instance = provisioner.create_instance(&create_request("web-1")).await.unwrap();
    let calls_before = host.hypervisor.calls();

    store.fail_commit(true);
    let err = provisioner.delete_instance(&instance.id, Some(OWNER)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Database);
    assert_eq!(host.hypervisor.calls(), calls_before);
    assert!(host.hypervisor.is_defined(&instance.id));
    assert!(host.vm_image(&instance.id).exists());
    assert!(host.cloudinit_iso(&instance.id).exists());

    store.fail_commit(false);
    assert!(store.get_instance(&instance.id, Some(OWNER)).await.is_ok());
}

#[tokio::test]
async fn test_delete_tolerates_missing_domain() {
    let host = TestHost::new().await;
    let provisioner = host.provisioner();
    let instance = provisioner.create_instance(&create_request("web-1")).await.unwrap();
    host.domains().delete(&instance.id).await.unwrap();

    provisioner.delete_instance(&instance.id, Some(OWNER)).await.unwrap();

    assert!(!host.vm_image(&instance.id).exists());
    assert!(provisioner.list_instances(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_tolerates_missing_files() {
    let host = TestHost::new().await;
    let provisioner = host.provisioner();
    let instance = provisioner.create_instance(&create_request("web-1")).await.unwrap();
    std::fs::remove_file(host.vm_image(&instance.id)).unwrap();

    provisioner.delete_instance(&instance.id, Some(OWNER)).await.unwrap();

    assert!(!host.cloudinit_iso(&instance.id).exists());
    assert!(!host.hypervisor.is_defined(&instance.id));
}

#[tokio::test]
async fn test_teardown_failure_after_commit_is_partial() {
    let host = TestHost::new().await;
    let provisioner = host.provisioner();
    let instance = provisioner.create_instance(&create_request("web-1")).await.unwrap();
    host.hypervisor.set_state(&instance.id, DomainState::Running);
    host.hypervisor.fail_destroy(true);

    let err = provisioner.delete_instance(&instance.id, Some(OWNER)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    // Logically deleted; the sweep cleans up the rest.
    assert!(provisioner.get_instance(&instance.id, None).await.unwrap_err().is_not_found());
    assert!(host.hypervisor.is_defined(&instance.id));
    assert!(host.vm_image(&instance.id).exists());

    host.hypervisor.fail_destroy(false);
    let report = provisioner.reconcile().await.unwrap();
    assert_eq!(report.orphan_domains, vec![instance.id]);
    assert_eq!(report.orphan_files.len(), 2);
    assert!(!host.hypervisor.is_defined(&instance.id));
    assert!(host.instance_files().is_empty());
}
