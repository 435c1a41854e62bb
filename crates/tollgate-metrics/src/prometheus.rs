//! Prometheus text exposition format.
//!
//! Renders usage snapshots into the Prometheus text exposition format for
//! scraping by a Prometheus server or compatible agent.

use tollgate_state::UsageSnapshot;

/// Render a list of usage snapshots into Prometheus text format.
///
/// Produces per-window GAUGE metrics with `table` and `instance` labels.
pub fn render_prometheus(snapshots: &[UsageSnapshot]) -> String {
    let mut out = String::new();

    out.push_str("# HELP tollgate_read_units Read units charged in the last window.\n");
    out.push_str("# TYPE tollgate_read_units gauge\n");
    for s in snapshots {
        out.push_str(&format!(
            "tollgate_read_units{{table=\"{}\",instance=\"{}\"}} {}\n",
            s.table_id, s.instance_id, s.read_units
        ));
    }

    out.push_str("# HELP tollgate_write_units Write units charged in the last window.\n");
    out.push_str("# TYPE tollgate_write_units gauge\n");
    for s in snapshots {
        out.push_str(&format!(
            "tollgate_write_units{{table=\"{}\",instance=\"{}\"}} {}\n",
            s.table_id, s.instance_id, s.write_units
        ));
    }

    out.push_str("# HELP tollgate_admitted Operations admitted in the last window.\n");
    out.push_str("# TYPE tollgate_admitted gauge\n");
    for s in snapshots {
        out.push_str(&format!(
            "tollgate_admitted{{table=\"{}\",instance=\"{}\"}} {}\n",
            s.table_id, s.instance_id, s.admitted
        ));
    }

    out.push_str("# HELP tollgate_throttled Operations that gave up throttled in the last window.\n");
    out.push_str("# TYPE tollgate_throttled gauge\n");
    for s in snapshots {
        out.push_str(&format!(
            "tollgate_throttled{{table=\"{}\",instance=\"{}\"}} {}\n",
            s.table_id, s.instance_id, s.throttled
        ));
    }

    out.push_str("# HELP tollgate_throttle_retries Throttling retries absorbed in the last window.\n");
    out.push_str("# TYPE tollgate_throttle_retries gauge\n");
    for s in snapshots {
        out.push_str(&format!(
            "tollgate_throttle_retries{{table=\"{}\",instance=\"{}\"}} {}\n",
            s.table_id, s.instance_id, s.throttle_retries
        ));
    }

    out
}
