use std::path::Path;

use prettytable::{Cell, Row, Table};

use crate::snapshot::probe::{PvState, SnapshotStatus};

fn yes_no(b: bool) -> &'static str {
    if b { "present" } else { "absent" }
}

fn show(p: Option<&Path>) -> String {
    p.map_or_else(|| "-".to_string(), |p| p.display().to_string())
}

fn pv_state(pv: &PvState) -> String {
    match pv {
        PvState::Absent => "not a PV".into(),
        PvState::Orphan => "orphan PV".into(),
        PvState::Member(vg) => format!("PV in {vg}"),
    }
}

pub fn status_table(st: &SnapshotStatus) -> Table {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Resource"),
        Cell::new("Path"),
        Cell::new("State"),
    ]));

    let mut row = |what: &str, path: &Path, state: String| {
        table.add_row(Row::new(vec![
            Cell::new(what),
            Cell::new(&path.display().to_string()),
            Cell::new(&state),
        ]));
    };

    row("Source LV", &st.source_device, yes_no(st.source_present).into());
    row("Snapshot LV", &st.snapshot_device, yes_no(st.snapshot_present).into());
    let mount_state = match (&st.mounted_from, st.mountpoint_exists) {
        (_, false) => "absent".to_string(),
        (None, true) => "not mounted".to_string(),
        (Some(src), true) if st.is_mounted() => format!("mounted from {}", src.display()),
        (Some(src), true) => format!("foreign mount from {}", src.display()),
    };
    row("Mountpoint", &st.mountpoint, mount_state);

    if let Some(lo) = &st.loop_backing {
        let attached = match &lo.attached {
            Some(f) if f == &lo.file => format!("attached to backing file, {}", pv_state(&lo.pv)),
            other => format!("attached: {}, {}", show(other.as_deref()), pv_state(&lo.pv)),
        };
        row("Loop device", &lo.device, attached);
        row("Backing file", &lo.file, yes_no(lo.file_exists).into());
    }
    table
}

pub fn log_status(st: &SnapshotStatus) {
    if st.is_mounted() {
        tracing::info!("snapshot is mounted at {}", st.mountpoint.display());
    } else if st.snapshot_present {
        tracing::info!("snapshot exists but is not mounted");
    } else {
        tracing::info!("<no snapshot>");
    }
    status_table(st).printstd();
}
