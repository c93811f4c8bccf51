//! Console reporting for suite runs and device listings.

use crate::coordinator::{RunStatus, RunSummary, RunTicket};
use crate::device::{DeviceRecord, DeviceState};

/// Prints a summary of a suite run to the console.
///
/// One line per device followed by pass/fail counts with colored output.
pub fn print_summary(suite: &str, summary: &RunSummary) {
    println!();
    println!("Suite {} results:", console::style(suite).bold());
    for ticket in &summary.tickets {
        println!("  {}", ticket_line(ticket));
    }

    println!();
    println!("  Devices: {}", summary.total);
    println!("  Passed:  {}", console::style(summary.passed).green());
    println!("  Failed:  {}", console::style(summary.failed).red());
    println!("  Skipped: {}", console::style(summary.skipped).yellow());

    if summary.abandoned > 0 {
        println!("  Abandoned: {}", console::style(summary.abandoned).red().bold());
    }
    if summary.retries > 0 {
        println!(
            "  Retries: {} ({} passed after retry)",
            summary.retries,
            console::style(summary.flaky).yellow()
        );
    }

    println!("  Duration: {:?}", summary.duration);

    println!();
    if summary.success() {
        println!("{}", console::style("All device runs passed!").green().bold());
    } else if summary.total == 0 {
        println!("{}", console::style("No device runs were recorded.").red().bold());
    } else {
        println!("{}", console::style("Some device runs failed.").red().bold());
    }
}

fn ticket_line(ticket: &RunTicket) -> String {
    let status = match ticket.status {
        RunStatus::Passed => console::style("PASS").green(),
        RunStatus::Failed if ticket.is_abandoned() => console::style("ABANDONED").red().bold(),
        RunStatus::Failed => console::style("FAIL").red(),
        RunStatus::Skipped => console::style("SKIP").yellow(),
        RunStatus::Running => console::style("RUNNING").dim(),
    };

    let mut line = format!(
        "{:<10} {} ({}) port {}",
        status, ticket.display_name, ticket.device_id, ticket.port
    );
    if ticket.attempts > 1 {
        line.push_str(&format!(", {} attempts", ticket.attempts));
    }
    if let Some(message) = &ticket.message
        && !ticket.is_abandoned()
    {
        line.push_str(&format!(": {}", message));
    }
    line
}

/// Prints discovered devices as an aligned table.
pub fn print_devices(devices: &[DeviceRecord]) {
    if devices.is_empty() {
        println!("  {}", console::style("no devices").dim());
        return;
    }

    for device in devices {
        let state = match device.state {
            DeviceState::Ready => console::style(format!("{:?}", device.state)).green(),
            DeviceState::Unavailable => console::style(format!("{:?}", device.state)).red(),
            _ => console::style(format!("{:?}", device.state)).yellow(),
        };
        println!(
            "  {:<40} {:<24} {:<8} {:<9} {}",
            device.device_id,
            device.display_name,
            device.os_version,
            format!("{:?}", device.kind),
            state
        );
    }
}
