//! Per-node result slots.

use crate::node::NodeConf;
use crate::BoxError;
use serde_json::Value;
use std::sync::Arc;

/// Holds the output for one node of the composition.
///
/// A slot settles exactly once: either pre-populated from the storage
/// snapshot or written by the node's background task. A settled slot with a
/// `Value::Null` value and no error is valid output - the null tells us the
/// builder really produced nothing, as opposed to not having run yet.
pub(crate) struct NodeSlot {
    pub conf: NodeConf,
    pub value: Option<Arc<Value>>,
    pub err: Option<Arc<BoxError>>,
    pub settled: bool,
}

impl NodeSlot {
    pub fn new(conf: NodeConf) -> Self {
        Self {
            conf,
            value: None,
            err: None,
            settled: false,
        }
    }

    /// Record the outcome of the node's builder.
    pub fn settle(&mut self, outcome: Result<Value, BoxError>) {
        match outcome {
            Ok(value) => self.value = Some(Arc::new(value)),
            Err(err) => self.err = Some(Arc::new(err)),
        }
        self.settled = true;
    }

    /// Pre-populate the slot from a storage snapshot.
    pub fn settle_from_storage(&mut self, value: Value) {
        self.value = Some(Arc::new(value));
        self.settled = true;
    }

    /// True when the slot settled successfully and carries a value.
    pub fn has_value(&self) -> bool {
        self.settled && self.err.is_none() && self.value.is_some()
    }
}

/// What the gather loop needs to know about one completed node.
pub(crate) struct NodeOutcome {
    pub required: bool,
    pub failed: bool,
}
