//! Headless replay of a journal through a `Session`.

use anyhow::{bail, Result};
use form_sync::{
    ActiveUser, DetachedGateway, Disposition, DocumentTree, FieldId, ManualClock, Operation,
    SectionId, Session, UserId,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Sections of the starting document, in order. At least one.
    pub sections: Vec<SectionId>,
    /// User the replica runs as.
    pub user: UserId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    /// Reconciled but left the tree alone.
    pub skipped: usize,
    pub dropped: usize,
    /// Re-deliveries of an already reconciled operation.
    pub duplicates: usize,
}

/// Starting document with the given sections, titled after their ids.
pub fn base_tree(sections: &[SectionId]) -> Result<DocumentTree> {
    let Some((first, rest)) = sections.split_first() else {
        bail!("At least one section is required");
    };
    let tree = rest.iter().fold(
        DocumentTree::new(first.clone(), first.as_str()),
        |tree, section| tree.with_section(section.clone(), section.as_str()),
    );
    Ok(tree)
}

/// Deliver `ops` in order to a fresh replica and return its tree.
pub fn replay(ops: &[Operation], options: &ReplayOptions) -> Result<(Arc<DocumentTree>, ReplayReport)> {
    let mut session = Session::new(
        ActiveUser::new(options.user.clone(), options.user.as_str()),
        base_tree(&options.sections)?,
        Arc::new(DetachedGateway),
    )
    .with_time_source(Arc::new(ManualClock::new(0)));

    for op in ops {
        session.receive(op.clone());
    }
    session.process_inbound();

    let mut report = ReplayReport::default();
    for entry in session.log().entries() {
        match &entry.disposition {
            Disposition::Applied => report.applied += 1,
            Disposition::NoOp(_) | Disposition::Superseded(_) => report.skipped += 1,
            Disposition::Dropped(_) => report.dropped += 1,
        }
    }
    report.duplicates = ops.len().saturating_sub(session.log().len());
    debug!(?report, "Replay finished");

    Ok((session.tree(), report))
}

/// Result of replaying the same journal in several delivery orders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub orders: usize,
    /// Every order produced the same tree, row order included.
    pub identical: bool,
    /// Fields whose content, section or row differs between orders.
    pub diverged_fields: Vec<FieldId>,
}

impl ConvergenceReport {
    pub fn converged(&self) -> bool {
        self.diverged_fields.is_empty()
    }
}

/// Delivery orders to try: as given, reversed, and every rotation.
fn delivery_orders(ops: &[Operation]) -> Vec<Vec<Operation>> {
    let mut orders = vec![ops.to_vec(), ops.iter().rev().cloned().collect()];
    for shift in 1..ops.len() {
        let mut rotated = ops.to_vec();
        rotated.rotate_left(shift);
        orders.push(rotated);
    }
    orders
}

/// Fields that are not alike in `a` and `b`: different content, or a
/// different section or row.
fn field_differences(a: &DocumentTree, b: &DocumentTree) -> BTreeSet<FieldId> {
    let ids: BTreeSet<FieldId> = a
        .fields_in_order()
        .into_iter()
        .chain(b.fields_in_order())
        .map(|field| field.id.clone())
        .collect();

    ids.into_iter()
        .filter(|id| {
            let place = |tree: &DocumentTree| {
                tree.locate(id)
                    .map(|placement| (placement.section_id, placement.row_id))
            };
            a.field(id) != b.field(id) || place(a) != place(b)
        })
        .collect()
}

/// Replay `ops` in several orders and compare the results with the first.
pub fn check_convergence(ops: &[Operation], options: &ReplayOptions) -> Result<ConvergenceReport> {
    let orders = delivery_orders(ops);
    let (reference, _) = replay(&orders[0], options)?;

    let mut identical = true;
    let mut diverged = BTreeSet::new();
    for (index, order) in orders.iter().enumerate().skip(1) {
        let (tree, _) = replay(order, options)?;
        if *tree != *reference {
            identical = false;
            let fields = field_differences(&reference, &tree);
            if !fields.is_empty() {
                warn!(order = index, fields = fields.len(), "Delivery order diverged");
            }
            diverged.extend(fields);
        }
    }

    info!(orders = orders.len(), identical, "Convergence check finished");
    Ok(ConvergenceReport {
        orders: orders.len(),
        identical,
        diverged_fields: diverged.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::parse_journal;

    fn options() -> ReplayOptions {
        ReplayOptions {
            sections: vec!["S1".parse().unwrap(), "S2".parse().unwrap()],
            user: "replay".parse().unwrap(),
        }
    }

    const JOURNAL: &str = r#"
{"type":"field_add","fieldId":"F1","userId":"alice","seq":1,"timestamp":1000,"value":{"id":"F1","type":"short_text","label":"Name","sectionId":"S1"}}
{"type":"field_add","fieldId":"F2","userId":"bob","seq":1,"timestamp":1100,"value":{"id":"F2","type":"email","label":"Email","sectionId":"S1"}}
{"type":"field_update","fieldId":"F1","userId":"bob","seq":2,"timestamp":2000,"value":{"label":"Full Name"}}
{"type":"field_update","fieldId":"F1","userId":"alice","seq":2,"timestamp":2000,"value":{"label":"Your Name","required":true}}
{"type":"field_move","fieldId":"F2","userId":"alice","seq":3,"timestamp":2500,"value":{"sectionId":"S2"}}
{"type":"field_delete","fieldId":"F2","userId":"bob","seq":3,"timestamp":2400,"value":null}
{"type":"field_update","fieldId":"F2","userId":"alice","seq":4,"timestamp":3000,"value":{"required":true}}
"#;

    #[test]
    fn test_replay_counts_dispositions() {
        let ops = parse_journal(JOURNAL).unwrap();
        let (tree, report) = replay(&ops, &options()).unwrap();

        let f1 = tree.field(&"F1".parse().unwrap()).unwrap();
        assert_eq!(f1.label, "Your Name");
        assert!(f1.required);
        assert!(!tree.contains_field(&"F2".parse().unwrap()));
        assert_eq!(report.applied + report.skipped, ops.len());
        assert_eq!(report.dropped, 0);
        assert_eq!(report.duplicates, 0);
    }

    #[test]
    fn test_redelivered_operations_count_as_duplicates() {
        let mut ops = parse_journal(JOURNAL).unwrap();
        ops.push(ops[0].clone());
        let (_, report) = replay(&ops, &options()).unwrap();
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn test_journal_converges_in_every_order() {
        let ops = parse_journal(JOURNAL).unwrap();
        let report = check_convergence(&ops, &options()).unwrap();
        assert_eq!(report.orders, ops.len() + 1);
        assert!(report.converged());
        assert!(report.identical);
    }

    #[test]
    fn test_base_tree_needs_a_section() {
        assert!(base_tree(&[]).is_err());
        let tree = base_tree(&options().sections).unwrap();
        assert_eq!(tree.sections().len(), 2);
    }
}
