//! Pre-flight validation and pump setup.
//!
//! Every check contributes its own issue so the operator sees all problems
//! at once. Pumps are only touched once both port selections are usable, and
//! any pump opened during a failed pre-flight is closed again.

use crate::device::{is_port_selected, PumpConnector, PumpPair};
use crate::error::PreflightIssues;
use crate::models::TestDraft;
use crate::project::Project;
use std::path::Path;

/// Most issues reported for one start request.
pub const MAX_REPORTED_ISSUES: usize = 10;

pub const ISSUE_NO_PROJECT: &str = "Select an existing project file first";
pub const ISSUE_NO_NAME: &str = "Name the experiment before starting";
pub const ISSUE_DUPLICATE_NAME: &str = "A test with this name already exists in the project";
pub const ISSUE_NO_CLARITY: &str = "Water clarity cannot be blank";
pub const ISSUE_SAME_PORTS: &str = "Select two unique ports";
pub const ISSUE_SAVE_PENDING: &str = "Save or discard the previous test first";

/// Checks on the project and the armed test. No device I/O.
pub fn validate_test(project: &Project, draft: &TestDraft, save_pending: bool) -> PreflightIssues {
    let mut issues = PreflightIssues::default();

    if save_pending {
        issues.push(ISSUE_SAVE_PENDING);
    }

    let path = project.info.path.trim();
    if path.is_empty() || !Path::new(path).is_file() {
        issues.push(ISSUE_NO_PROJECT);
    }

    let name = draft.name.trim();
    if name.is_empty() {
        issues.push(ISSUE_NO_NAME);
    } else if project.has_test_named(name) {
        issues.push(ISSUE_DUPLICATE_NAME);
    }

    if draft.clarity.trim().is_empty() && !draft.is_blank {
        issues.push(ISSUE_NO_CLARITY);
    }

    for problem in project.limits().problems() {
        issues.push(problem);
    }

    issues
}

/// Both ports selected and distinct.
pub fn validate_ports(port1: &str, port2: &str) -> PreflightIssues {
    let mut issues = PreflightIssues::default();
    if !is_port_selected(port1) {
        issues.push("Select a port for pump 1");
    }
    if !is_port_selected(port2) {
        issues.push("Select a port for pump 2");
    }
    if port1.trim() == port2.trim() {
        issues.push(ISSUE_SAME_PORTS);
    }
    issues
}

/// Open both pumps and set their flow rate.
///
/// On any failure the pumps that did open are shut down again and every
/// failure is reported.
pub fn open_pumps(
    connector: &dyn PumpConnector,
    port1: &str,
    port2: &str,
    flowrate: f64,
) -> Result<PumpPair, PreflightIssues> {
    let mut pair = PumpPair::new(connector.connect(port1.trim()), connector.connect(port2.trim()));
    let mut issues = PreflightIssues::default();

    for pump in pair.each_mut() {
        if let Err(e) = pump.open() {
            log::error!("[Preflight] {} (phase: arming)", e);
            issues.push(format!("Couldn't connect to {}", pump.port()));
            continue;
        }
        match pump.set_flowrate(flowrate) {
            Ok(()) => log::info!("[Preflight] Set flowrate on {} to {}", pump.port(), flowrate),
            Err(e) => {
                log::error!("[Preflight] {} (phase: arming)", e);
                issues.push(format!("Couldn't set the flowrate on {}", pump.port()));
            }
        }
    }

    if issues.is_empty() {
        Ok(pair)
    } else {
        for e in pair.shut_down() {
            log::warn!("[Preflight] Failed to close {}: {}", e.port(), e);
        }
        Err(issues)
    }
}

/// Port checks then pump setup, on top of issues already found.
///
/// Pumps are opened even when `issues` is non-empty so connection problems
/// are reported in the same pass, then closed again.
pub fn arm_pumps(
    connector: &dyn PumpConnector,
    port1: &str,
    port2: &str,
    flowrate: f64,
    mut issues: PreflightIssues,
) -> Result<PumpPair, PreflightIssues> {
    let port_issues = validate_ports(port1, port2);
    if !port_issues.is_empty() {
        issues.extend(port_issues);
        return Err(issues.capped(MAX_REPORTED_ISSUES));
    }

    match open_pumps(connector, port1, port2, flowrate) {
        Ok(mut pair) if !issues.is_empty() => {
            for e in pair.shut_down() {
                log::warn!("[Preflight] Failed to close {}: {}", e.port(), e);
            }
            Err(issues.capped(MAX_REPORTED_ISSUES))
        }
        Ok(pair) => Ok(pair),
        Err(open_issues) => {
            issues.extend(open_issues);
            Err(issues.capped(MAX_REPORTED_ISSUES))
        }
    }
}
