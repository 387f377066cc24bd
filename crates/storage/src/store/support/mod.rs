#![forbid(unsafe_code)]

pub(super) mod edges_tx;
pub(super) mod history_tx;
pub(super) mod perm_tx;
pub(super) mod state_tx;

/// "?,?,?" for dynamic IN clauses.
pub(in crate::store) fn sql_placeholders(count: usize) -> String {
    let mut out = String::new();
    for index in 0..count {
        if index > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}
