//! Shell scripts run on the SUT, with `%%NAME` placeholders.

pub const PERF_TEMPLATE: &str = r#"#!/bin/bash
TMP_DIR=%%HPERF_PERF_DIR
perf_result="$TMP_DIR"/perf_result
perf_error="$TMP_DIR"/perf_error
date +%s.%N > "$TMP_DIR"/perf_start_timestamp
3>"$perf_result" perf stat -e %%HPERF_EVENT_GROUPS_STR -A -a -x $'\t' -I %%HPERF_INTERVAL --log-fd 3 %%HPERF_COMMAND 2>"$perf_error"
"#;

pub const SAR_TEMPLATE: &str = r#"#!/bin/bash
set -o pipefail
TMP_DIR=%%HPERF_SAR_DIR
sar_raw="$TMP_DIR"/sar_raw
sar -A -o "$sar_raw" 1 %%HPERF_SAR_TIME > /dev/null 2>"$TMP_DIR"/sar_error || exit 1
to_csv() { sed -e '1s/^# //' -e 's/;/,/g'; }
sadf -d -U "$sar_raw" -- -u %%HPERF_P_STR | to_csv > "$TMP_DIR"/sar_u || exit 1
sadf -d -U "$sar_raw" -- -r | to_csv > "$TMP_DIR"/sar_r || exit 1
sadf -d -U "$sar_raw" -- -n DEV | to_csv > "$TMP_DIR"/sar_n_dev || exit 1
sadf -d -U "$sar_raw" -- -d | to_csv > "$TMP_DIR"/sar_d || exit 1
"#;

/// Replaces every `%%NAME` with its value. Placeholders without a value are
/// left in place.
pub fn render(template: &str, params: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find("%%") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..len];

        match params.iter().find(|(key, _)| *key == name) {
            Some((_, value)) => out.push_str(value),
            None => {
                out.push_str("%%");
                out.push_str(name);
            }
        }
        rest = &after[len..];
    }

    out.push_str(rest);
    out
}
