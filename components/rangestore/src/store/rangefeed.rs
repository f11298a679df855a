// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The per-range change-data stream.
//!
//! Application appends logical operation logs to the processor; registered
//! consumers drain them from their own channel. Disconnection is an
//! out-of-band signal: the registration receives a terminal event and is
//! dropped from the processor, and the consumer must re-register (retriable
//! reasons) or give up (history mutation).

use std::fmt::{self, Display, Formatter};

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::hlc::Timestamp;
use crate::store::state::{RangeId, Span};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOpKind {
    MvccWrite,
    MvccCommitIntent,
}

/// One logical mutation mirrored from an applied command's write batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogicalOp {
    pub kind: LogicalOpKind,
    /// User key of the mutation.
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
    pub value: Vec<u8>,
    /// Populated at application time from the storage batch so consumers see
    /// before/after pairs. Never travels through the log.
    #[serde(skip)]
    pub prev_value: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangefeedRetryReason {
    RangeSplit,
    RangeMerged,
    ReplicaRemoved,
}

impl Display for RangefeedRetryReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RangefeedRetryReason::RangeSplit => "range split",
            RangefeedRetryReason::RangeMerged => "range merged",
            RangefeedRetryReason::ReplicaRemoved => "replica removed",
        };
        write!(f, "{}", reason)
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum RangefeedError {
    /// The stream ended for a lifecycle reason; re-register to resume.
    #[error("rangefeed must retry: {0}")]
    Retry(RangefeedRetryReason),
    /// MVCC history under the registration was rewritten; emitted data can no
    /// longer be trusted and the stream must not be resumed blindly.
    #[error("mvcc history mutation in span {0:?}")]
    HistoryMutation(Span),
}

#[derive(Clone, Debug, PartialEq)]
pub enum RangefeedEvent {
    Ops(Vec<LogicalOp>),
    /// A file ingestion whose keys are visible at `write_timestamp`.
    SstIngested {
        span: Span,
        write_timestamp: Timestamp,
    },
    /// Terminal event; the registration is gone after this.
    Disconnected(RangefeedError),
}

struct Registration {
    span: Span,
    sink: Sender<RangefeedEvent>,
}

/// Single-producer event fan-out for one range. The replica appends under its
/// raft mutex; consumers drain concurrently from their channels.
pub struct RangefeedProcessor {
    range_id: RangeId,
    registrations: Vec<Registration>,
}

impl RangefeedProcessor {
    pub fn new(range_id: RangeId) -> RangefeedProcessor {
        RangefeedProcessor {
            range_id,
            registrations: vec![],
        }
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn register(&mut self, span: Span) -> Receiver<RangefeedEvent> {
        let (tx, rx) = unbounded();
        self.registrations.push(Registration { span, sink: tx });
        rx
    }

    pub fn publish_ops(&mut self, ops: Vec<LogicalOp>) {
        self.each_overlapping(|op_span| ops.iter().any(|op| op_span.contains(&op.key)), |_| {
            RangefeedEvent::Ops(ops.clone())
        });
    }

    pub fn publish_sst(&mut self, span: Span, write_timestamp: Timestamp) {
        self.each_overlapping(
            |reg_span| reg_span.overlaps(&span),
            |_| RangefeedEvent::SstIngested {
                span: span.clone(),
                write_timestamp,
            },
        );
    }

    /// Disconnects registrations overlapping `span`, leaving the others
    /// running.
    pub fn disconnect_span(&mut self, span: &Span, err: RangefeedError) {
        self.registrations.retain(|reg| {
            if reg.span.overlaps(span) {
                let _ = reg.sink.send(RangefeedEvent::Disconnected(err.clone()));
                false
            } else {
                true
            }
        });
    }

    /// Disconnects every registration with `err`.
    pub fn disconnect_all(&mut self, err: RangefeedError) {
        for reg in self.registrations.drain(..) {
            let _ = reg.sink.send(RangefeedEvent::Disconnected(err.clone()));
        }
    }

    fn each_overlapping(
        &mut self,
        mut wants: impl FnMut(&Span) -> bool,
        mut event: impl FnMut(&Span) -> RangefeedEvent,
    ) {
        // A consumer that went away is dropped silently; disconnection is
        // only signalled for lifecycle reasons.
        self.registrations.retain(|reg| {
            if !wants(&reg.span) {
                return true;
            }
            reg.sink.send(event(&reg.span)).is_ok()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(key: &[u8]) -> LogicalOp {
        LogicalOp {
            kind: LogicalOpKind::MvccWrite,
            key: key.to_vec(),
            timestamp: Timestamp::new(1, 0),
            value: b"v".to_vec(),
            prev_value: None,
        }
    }

    #[test]
    fn test_publish_ops_filters_by_span() {
        let mut p = RangefeedProcessor::new(1);
        let rx_ab = p.register(Span::new(b"a".to_vec(), b"b".to_vec()));
        let rx_mz = p.register(Span::new(b"m".to_vec(), b"z".to_vec()));

        p.publish_ops(vec![op(b"aa")]);
        assert_eq!(rx_ab.try_recv().unwrap(), RangefeedEvent::Ops(vec![op(b"aa")]));
        assert!(rx_mz.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_span() {
        let mut p = RangefeedProcessor::new(1);
        let rx_ab = p.register(Span::new(b"a".to_vec(), b"b".to_vec()));
        let rx_mz = p.register(Span::new(b"m".to_vec(), b"z".to_vec()));

        let doomed = Span::new(b"aa".to_vec(), b"ab".to_vec());
        p.disconnect_span(&doomed, RangefeedError::HistoryMutation(doomed.clone()));
        assert_eq!(
            rx_ab.try_recv().unwrap(),
            RangefeedEvent::Disconnected(RangefeedError::HistoryMutation(doomed))
        );
        assert!(rx_mz.try_recv().is_err());
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_disconnect_all() {
        let mut p = RangefeedProcessor::new(1);
        let rx1 = p.register(Span::new(b"a".to_vec(), b"z".to_vec()));
        let rx2 = p.register(Span::new(b"a".to_vec(), b"z".to_vec()));
        p.disconnect_all(RangefeedError::Retry(RangefeedRetryReason::RangeSplit));
        for rx in [rx1, rx2] {
            assert_eq!(
                rx.try_recv().unwrap(),
                RangefeedEvent::Disconnected(RangefeedError::Retry(
                    RangefeedRetryReason::RangeSplit
                ))
            );
        }
        assert!(p.is_empty());
    }

    #[test]
    fn test_gone_consumer_is_dropped_silently() {
        let mut p = RangefeedProcessor::new(1);
        let rx = p.register(Span::new(b"a".to_vec(), b"z".to_vec()));
        drop(rx);
        p.publish_ops(vec![op(b"k")]);
        assert!(p.is_empty());
    }
}
