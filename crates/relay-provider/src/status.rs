//! The pod status state machine.
//!
//! Everything here is a pure function over Kubernetes status objects so that
//! the transitions can be tested without a relay.
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    ContainerStatus, PodCondition, PodStatus as KubePodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use relay_api::PodStatus;
use virtual_kubelet::Pod;

/// Reason carried by containers terminated because their pod was deleted.
pub const DELETED_CONTAINER_REASON: &str = "ProviderPodContainerDeleted";
/// Reason carried by a pod that was deleted.
pub const DELETED_POD_REASON: &str = "ProviderPodDeleted";

const PENDING_INIT_REASON: &str = "pending init containers";
const POD_INITIALIZING: &str = "PodInitializing";
const COMPLETED: &str = "Completed";

/// A pod phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Accepted but not running yet.
    Pending,
    /// At least one container is running.
    Running,
    /// Every container exited with 0.
    Succeeded,
    /// A container failed.
    Failed,
}

impl Phase {
    /// The phase as Kubernetes spells it.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
        }
    }

    fn parse(phase: Option<&str>) -> Option<Self> {
        match phase? {
            "Pending" => Some(Phase::Pending),
            "Running" => Some(Phase::Running),
            "Succeeded" => Some(Phase::Succeeded),
            "Failed" => Some(Phase::Failed),
            _ => None,
        }
    }

    /// Whether the phase can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

/// Whether `status` is in a terminal phase.
pub fn is_terminal(status: &KubePodStatus) -> bool {
    Phase::parse(status.phase.as_deref()).map_or(false, Phase::is_terminal)
}

/// The status a pod gets as soon as it is accepted, before the relay has
/// seen it.
pub fn initial_status(pod: &Pod, pod_ip: &str) -> KubePodStatus {
    let now = Time(Utc::now());
    let has_init = !pod.init_containers().is_empty();
    let phase = if has_init { Phase::Running } else { Phase::Pending };

    let container_statuses = pod
        .containers()
        .iter()
        .map(|c| {
            let state = if has_init {
                waiting(PENDING_INIT_REASON)
            } else {
                ContainerState {
                    running: Some(ContainerStateRunning {
                        started_at: Some(now.clone()),
                    }),
                    ..Default::default()
                }
            };
            ContainerStatus {
                name: c.name.clone(),
                image: c.image.clone().unwrap_or_default(),
                ready: !has_init,
                state: Some(state),
                ..Default::default()
            }
        })
        .collect();
    let init_container_statuses = pod
        .init_containers()
        .iter()
        .map(|c| ContainerStatus {
            name: c.name.clone(),
            image: c.image.clone().unwrap_or_default(),
            state: Some(waiting(POD_INITIALIZING)),
            ..Default::default()
        })
        .collect();

    KubePodStatus {
        phase: Some(phase.as_str().to_string()),
        conditions: Some(conditions(phase)),
        host_ip: Some(pod_ip.to_string()),
        pod_ip: Some(pod_ip.to_string()),
        start_time: Some(now),
        container_statuses: Some(container_statuses),
        init_container_statuses: Some(init_container_statuses),
        ..Default::default()
    }
}

/// Mark the pod Failed with `reason`. No container is ready afterwards.
pub fn fail(status: &mut KubePodStatus, reason: &str, message: &str) {
    status.phase = Some(Phase::Failed.as_str().to_string());
    status.reason = Some(reason.to_string());
    status.message = Some(message.to_string());
    status.conditions = Some(conditions(Phase::Failed));
    for c in all_containers(status) {
        c.ready = false;
    }
}

/// Mark every container and init container terminated because the pod was
/// deleted.
pub fn terminate_all(status: &mut KubePodStatus) {
    let now = Time(Utc::now());
    status.reason = Some(DELETED_POD_REASON.to_string());
    for c in all_containers(status) {
        c.ready = false;
        c.state = Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                reason: Some(DELETED_CONTAINER_REASON.to_string()),
                message: Some("provider terminated container upon deletion".to_string()),
                finished_at: Some(now.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
}

/// Fold a status reported by the relay into `status`.
///
/// Returns whether anything changed, i.e. whether the pod needs pushing.
pub fn apply_remote_status(status: &mut KubePodStatus, remote: &PodStatus) -> bool {
    if is_terminal(status) {
        return false;
    }
    let before = status.clone();

    let total_init = remote.init_containers.len();
    let mut init_done = 0;
    let mut init_running = false;
    let mut init_failure = None;
    for reported in &remote.init_containers {
        let mut reported = reported.clone();
        match kind(&reported) {
            StateKind::Terminated(code) => {
                init_done += 1;
                let reason = if code != 0 {
                    let reason = format!("Error: {}", code);
                    init_failure.get_or_insert_with(|| reason.clone());
                    reason
                } else {
                    COMPLETED.to_string()
                };
                set_terminated_reason(&mut reported, &reason);
                reported.ready = false;
            }
            StateKind::Running => init_running = true,
            StateKind::Waiting => {}
        }
        upsert(status.init_container_statuses.get_or_insert_with(Vec::new), reported);
    }

    let phase = if let Some(reason) = init_failure {
        status.reason = Some(reason);
        for c in status.container_statuses.iter_mut().flatten() {
            c.ready = false;
        }
        Some(Phase::Failed)
    } else if init_done < total_init {
        let reason = if init_running || init_done > 0 {
            format!("Init:{}/{}", init_done, total_init)
        } else {
            POD_INITIALIZING.to_string()
        };
        for c in status.container_statuses.iter_mut().flatten() {
            c.ready = false;
            c.state = Some(waiting(&reason));
        }
        Some(Phase::Pending)
    } else {
        apply_main_containers(status, remote)
    };

    if let Some(phase) = phase {
        status.phase = Some(phase.as_str().to_string());
        status.conditions = Some(conditions(phase));
    }
    *status != before
}

fn apply_main_containers(status: &mut KubePodStatus, remote: &PodStatus) -> Option<Phase> {
    let mut terminated = 0;
    let mut failure = None;
    let mut running = false;
    let mut reported_statuses = Vec::with_capacity(remote.containers.len());
    for reported in &remote.containers {
        let mut reported = reported.clone();
        match kind(&reported) {
            StateKind::Terminated(code) => {
                terminated += 1;
                if code != 0 {
                    failure.get_or_insert(code);
                }
            }
            StateKind::Running => {
                running = true;
                reported.ready = true;
            }
            StateKind::Waiting => {}
        }
        reported_statuses.push(reported);
    }

    let total = reported_statuses.len();
    let phase = if total > 0 && terminated == total {
        let reason = match failure {
            Some(code) => format!("Error: {}", code),
            None => COMPLETED.to_string(),
        };
        for c in reported_statuses.iter_mut() {
            c.ready = false;
            set_terminated_reason(c, &reason);
        }
        status.reason = Some(reason);
        Some(if failure.is_some() {
            Phase::Failed
        } else {
            Phase::Succeeded
        })
    } else if running {
        Some(Phase::Running)
    } else {
        None
    };

    let statuses = status.container_statuses.get_or_insert_with(Vec::new);
    for reported in reported_statuses {
        upsert(statuses, reported);
    }
    phase
}

/// The `Initialized`, `Ready` and `PodScheduled` conditions implied by `phase`.
pub fn conditions(phase: Phase) -> Vec<PodCondition> {
    let (initialized, ready, scheduled) = match phase {
        Phase::Running => (true, true, true),
        Phase::Pending => (true, false, true),
        Phase::Succeeded => (true, false, true),
        Phase::Failed => (false, false, false),
    };
    vec![
        condition("Initialized", initialized),
        condition("Ready", ready),
        condition("PodScheduled", scheduled),
    ]
}

fn condition(type_: &str, status: bool) -> PodCondition {
    PodCondition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        ..Default::default()
    }
}

enum StateKind {
    Waiting,
    Running,
    Terminated(i32),
}

fn kind(status: &ContainerStatus) -> StateKind {
    match &status.state {
        Some(ContainerState {
            terminated: Some(t),
            ..
        }) => StateKind::Terminated(t.exit_code),
        Some(ContainerState {
            running: Some(_), ..
        }) => StateKind::Running,
        _ => StateKind::Waiting,
    }
}

fn waiting(reason: &str) -> ContainerState {
    ContainerState {
        waiting: Some(ContainerStateWaiting {
            reason: Some(reason.to_string()),
            message: None,
        }),
        ..Default::default()
    }
}

fn set_terminated_reason(status: &mut ContainerStatus, reason: &str) {
    if let Some(t) = status.state.as_mut().and_then(|s| s.terminated.as_mut()) {
        if t.reason.is_none() {
            t.reason = Some(reason.to_string());
        }
    }
}

fn upsert(statuses: &mut Vec<ContainerStatus>, status: ContainerStatus) {
    match statuses.iter_mut().find(|s| s.name == status.name) {
        Some(existing) => *existing = status,
        None => statuses.push(status),
    }
}

fn all_containers(status: &mut KubePodStatus) -> impl Iterator<Item = &mut ContainerStatus> {
    status
        .container_statuses
        .iter_mut()
        .flatten()
        .chain(status.init_container_statuses.iter_mut().flatten())
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, Pod as KubePod, PodSpec};

    fn pod(init: &[&str], containers: &[&str]) -> Pod {
        let container = |name: &&str| Container {
            name: name.to_string(),
            ..Default::default()
        };
        Pod::from(KubePod {
            spec: Some(PodSpec {
                containers: containers.iter().map(container).collect(),
                init_containers: if init.is_empty() {
                    None
                } else {
                    Some(init.iter().map(container).collect())
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn running(name: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn exited(name: &str, code: i32) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: code,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn remote(init: Vec<ContainerStatus>, containers: Vec<ContainerStatus>) -> PodStatus {
        PodStatus {
            pod_uid: "u1".to_string(),
            init_containers: init,
            containers,
            ..Default::default()
        }
    }

    fn condition_status(status: &KubePodStatus, type_: &str) -> String {
        status
            .conditions
            .iter()
            .flatten()
            .find(|c| c.type_ == type_)
            .map(|c| c.status.clone())
            .unwrap()
    }

    #[test]
    fn pods_without_init_containers_start_pending() {
        let status = initial_status(&pod(&[], &["c1"]), "10.0.0.1");
        assert_eq!(status.phase.as_deref(), Some("Pending"));
        assert_eq!(status.pod_ip.as_deref(), Some("10.0.0.1"));
        assert!(status.start_time.is_some());
        let c1 = &status.container_statuses.as_ref().unwrap()[0];
        assert!(c1.ready);
        assert!(c1.state.as_ref().unwrap().running.is_some());
        assert_eq!(condition_status(&status, "Ready"), "False");
    }

    #[test]
    fn pods_with_init_containers_start_running_but_not_ready() {
        let status = initial_status(&pod(&["i1"], &["c1"]), "127.0.0.1");
        assert_eq!(status.phase.as_deref(), Some("Running"));
        let c1 = &status.container_statuses.as_ref().unwrap()[0];
        assert!(!c1.ready);
        let reason = c1.state.as_ref().unwrap().waiting.as_ref().unwrap().reason.clone();
        assert_eq!(reason.as_deref(), Some(PENDING_INIT_REASON));
        assert_eq!(status.init_container_statuses.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn running_report_moves_pod_to_running() {
        let mut status = initial_status(&pod(&[], &["c1"]), "127.0.0.1");
        assert!(apply_remote_status(&mut status, &remote(vec![], vec![running("c1")])));
        assert_eq!(status.phase.as_deref(), Some("Running"));
        assert_eq!(condition_status(&status, "Ready"), "True");
        assert!(status.container_statuses.as_ref().unwrap()[0].ready);

        // The same report again changes nothing.
        assert!(!apply_remote_status(&mut status, &remote(vec![], vec![running("c1")])));
    }

    #[test]
    fn all_terminated_with_failure_fails_the_pod() {
        let mut status = initial_status(&pod(&[], &["c1", "c2"]), "127.0.0.1");
        let report = remote(vec![], vec![exited("c1", 0), exited("c2", 3)]);
        assert!(apply_remote_status(&mut status, &report));
        assert_eq!(status.phase.as_deref(), Some("Failed"));
        assert_eq!(status.reason.as_deref(), Some("Error: 3"));
        assert_eq!(condition_status(&status, "PodScheduled"), "False");
    }

    #[test]
    fn all_terminated_cleanly_succeeds() {
        let mut status = initial_status(&pod(&[], &["c1"]), "127.0.0.1");
        assert!(apply_remote_status(&mut status, &remote(vec![], vec![exited("c1", 0)])));
        assert_eq!(status.phase.as_deref(), Some("Succeeded"));
        assert_eq!(status.reason.as_deref(), Some("Completed"));
    }

    #[test]
    fn partial_termination_keeps_running() {
        let mut status = initial_status(&pod(&[], &["c1", "c2"]), "127.0.0.1");
        let report = remote(vec![], vec![exited("c1", 1), running("c2")]);
        apply_remote_status(&mut status, &report);
        assert_eq!(status.phase.as_deref(), Some("Running"));
    }

    #[test]
    fn waiting_only_reports_do_not_change_phase() {
        let mut status = initial_status(&pod(&[], &["c1"]), "127.0.0.1");
        let creating = ContainerStatus {
            name: "c1".to_string(),
            state: Some(waiting("ContainerCreating")),
            ..Default::default()
        };
        apply_remote_status(&mut status, &remote(vec![], vec![creating]));
        assert_eq!(status.phase.as_deref(), Some("Pending"));
    }

    #[test]
    fn terminal_pods_never_change() {
        let mut status = initial_status(&pod(&[], &["c1"]), "127.0.0.1");
        apply_remote_status(&mut status, &remote(vec![], vec![exited("c1", 0)]));
        assert!(!apply_remote_status(&mut status, &remote(vec![], vec![running("c1")])));
        assert_eq!(status.phase.as_deref(), Some("Succeeded"));
    }

    #[test]
    fn init_progress_is_reported_on_main_containers() {
        let mut status = initial_status(&pod(&["i1", "i2"], &["c1"]), "127.0.0.1");
        let report = remote(vec![exited("i1", 0), running("i2")], vec![]);
        assert!(apply_remote_status(&mut status, &report));
        assert_eq!(status.phase.as_deref(), Some("Pending"));
        let c1 = &status.container_statuses.as_ref().unwrap()[0];
        let reason = c1.state.as_ref().unwrap().waiting.as_ref().unwrap().reason.clone();
        assert_eq!(reason.as_deref(), Some("Init:1/2"));
    }

    #[test]
    fn failed_init_container_fails_the_pod() {
        let mut status = initial_status(&pod(&["i1"], &["c1"]), "127.0.0.1");
        let report = remote(vec![exited("i1", 2)], vec![]);
        assert!(apply_remote_status(&mut status, &report));
        assert_eq!(status.phase.as_deref(), Some("Failed"));
        assert_eq!(status.reason.as_deref(), Some("Error: 2"));
        let i1 = &status.init_container_statuses.as_ref().unwrap()[0];
        let reason = i1.state.as_ref().unwrap().terminated.as_ref().unwrap().reason.clone();
        assert_eq!(reason.as_deref(), Some("Error: 2"));
    }

    #[test]
    fn finished_init_containers_hand_over_to_main_containers() {
        let mut status = initial_status(&pod(&["i1"], &["c1"]), "127.0.0.1");
        let report = remote(vec![exited("i1", 0)], vec![running("c1")]);
        apply_remote_status(&mut status, &report);
        assert_eq!(status.phase.as_deref(), Some("Running"));
        assert!(status.container_statuses.as_ref().unwrap()[0].ready);
    }

    #[test]
    fn deletion_terminates_every_container() {
        let mut status = initial_status(&pod(&["i1"], &["c1"]), "127.0.0.1");
        terminate_all(&mut status);
        assert_eq!(status.reason.as_deref(), Some(DELETED_POD_REASON));
        for c in status
            .container_statuses
            .iter()
            .flatten()
            .chain(status.init_container_statuses.iter().flatten())
        {
            assert!(!c.ready);
            let reason = c.state.as_ref().unwrap().terminated.as_ref().unwrap().reason.clone();
            assert_eq!(reason.as_deref(), Some(DELETED_CONTAINER_REASON));
        }
    }
}
