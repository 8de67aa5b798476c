//! Fan-out of one batch to several downstream consumers.
//!
//! The fan-out never copies for readers: consumers that do not mutate get a
//! shared handle onto the batch. Mutating consumers get their own deep copy,
//! except that with no readers present the last mutating consumer is handed
//! the original.

use crate::consumer::{Capabilities, ConsumeError, Consumer, DynConsumer};
use crate::context::Context;
use crate::error::GraphError;
use async_trait::async_trait;
use otel_agent_pdata::Batch;
use std::sync::Arc;

/// Builds a consumer dispatching every batch to all of `consumers`.
///
/// A single consumer is returned unchanged.
///
/// # Errors
///
/// Returns [`GraphError::NilNextConsumer`] when `consumers` is empty.
pub fn new_fanout<T: Batch>(
    mut consumers: Vec<DynConsumer<T>>,
) -> Result<DynConsumer<T>, GraphError> {
    match consumers.len() {
        0 => Err(GraphError::NilNextConsumer),
        1 => Ok(consumers.remove(0)),
        _ => Ok(Arc::new(FanOut::new(consumers))),
    }
}

struct Branch<T: Batch> {
    consumer: DynConsumer<T>,
    mutates: bool,
}

struct FanOut<T: Batch> {
    branches: Vec<Branch<T>>,
    // Branch that receives the original batch instead of a copy.
    original_to: Option<usize>,
}

impl<T: Batch> FanOut<T> {
    fn new(consumers: Vec<DynConsumer<T>>) -> Self {
        let branches: Vec<Branch<T>> = consumers
            .into_iter()
            .map(|consumer| Branch {
                mutates: consumer.capabilities().mutates_data,
                consumer,
            })
            .collect();

        let has_readers = branches.iter().any(|b| !b.mutates);
        let original_to = if has_readers {
            None
        } else {
            branches.iter().rposition(|b| b.mutates)
        };

        Self {
            branches,
            original_to,
        }
    }
}

#[async_trait]
impl<T: Batch> Consumer<T> for FanOut<T> {
    fn capabilities(&self) -> Capabilities {
        Capabilities::READ_ONLY
    }

    async fn consume(&self, ctx: &Context, mut batch: T) -> Result<(), ConsumeError> {
        let mut errors = Vec::new();

        for (index, branch) in self.branches.iter().enumerate() {
            let handle = if Some(index) == self.original_to {
                std::mem::take(&mut batch)
            } else if branch.mutates {
                batch.deep_copy()
            } else {
                batch.as_shared()
            };

            if let Err(e) = branch.consumer.consume(ctx, handle).await {
                errors.push(e);
            }
        }

        ConsumeError::join(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SinkConsumer;
    use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
    use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
    use otel_agent_pdata::Traces;
    use std::sync::Mutex;

    fn three_spans() -> Traces {
        Traces::new(ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(Resource::default()),
                scope_spans: vec![ScopeSpans {
                    spans: (0..3)
                        .map(|i| Span {
                            name: format!("span-{i}"),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        })
    }

    /// Appends a resource attribute to every batch, then keeps it.
    struct Annotator {
        seen: Mutex<Vec<Traces>>,
    }

    #[async_trait]
    impl Consumer<Traces> for Annotator {
        fn capabilities(&self) -> Capabilities {
            Capabilities::MUTATES
        }

        async fn consume(&self, _ctx: &Context, mut batch: Traces) -> Result<(), ConsumeError> {
            for rs in &mut batch.request_mut().resource_spans {
                rs.resource
                    .get_or_insert_with(Resource::default)
                    .attributes
                    .push(KeyValue {
                        key: "annotated".to_string(),
                        value: Some(AnyValue {
                            value: Some(any_value::Value::BoolValue(true)),
                        }),
                    });
            }
            self.seen.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn annotated(batch: &Traces) -> bool {
        batch
            .resource_spans()
            .iter()
            .filter_map(|rs| rs.resource.as_ref())
            .any(|r| r.attributes.iter().any(|kv| kv.key == "annotated"))
    }

    #[test]
    fn test_empty_list_is_rejected() {
        assert!(matches!(
            new_fanout::<Traces>(vec![]),
            Err(GraphError::NilNextConsumer)
        ));
    }

    #[test]
    fn test_single_consumer_is_identity() {
        let sink: DynConsumer<Traces> = Arc::new(SinkConsumer::<Traces>::new());
        let fanout = new_fanout(vec![Arc::clone(&sink)]).unwrap();
        assert!(Arc::ptr_eq(&sink, &fanout));
    }

    #[tokio::test]
    async fn test_every_consumer_called_once() {
        let a = Arc::new(SinkConsumer::<Traces>::new());
        let b = Arc::new(SinkConsumer::<Traces>::new());
        let fanout = new_fanout(vec![a.clone() as DynConsumer<Traces>, b.clone()]).unwrap();

        fanout
            .consume(&Context::background(), three_spans())
            .await
            .unwrap();

        assert_eq!(a.batch_count(), 1);
        assert_eq!(b.batch_count(), 1);
        assert_eq!(a.item_count() + b.item_count(), 6);
    }

    #[tokio::test]
    async fn test_readers_share_one_request() {
        let a = Arc::new(SinkConsumer::<Traces>::new());
        let b = Arc::new(SinkConsumer::<Traces>::new());
        let fanout = new_fanout(vec![a.clone() as DynConsumer<Traces>, b.clone()]).unwrap();

        fanout
            .consume(&Context::background(), three_spans())
            .await
            .unwrap();

        let a_batches = a.batches();
        let b_batches = b.batches();
        assert!(a_batches[0].is_shared());
        assert!(a_batches[0].same_request(&b_batches[0]));
    }

    #[tokio::test]
    async fn test_mutator_does_not_leak_into_reader() {
        let mutator = Arc::new(Annotator {
            seen: Mutex::new(Vec::new()),
        });
        let reader = Arc::new(SinkConsumer::<Traces>::new());
        let fanout =
            new_fanout(vec![mutator.clone() as DynConsumer<Traces>, reader.clone()]).unwrap();

        fanout
            .consume(&Context::background(), three_spans())
            .await
            .unwrap();

        assert!(annotated(&mutator.seen.lock().unwrap()[0]));
        assert!(!annotated(&reader.batches()[0]));
    }

    #[tokio::test]
    async fn test_mutators_get_independent_copies() {
        let first = Arc::new(Annotator {
            seen: Mutex::new(Vec::new()),
        });
        let second = Arc::new(Annotator {
            seen: Mutex::new(Vec::new()),
        });
        let fanout =
            new_fanout(vec![first.clone() as DynConsumer<Traces>, second.clone()]).unwrap();

        fanout
            .consume(&Context::background(), three_spans())
            .await
            .unwrap();

        let first_seen = first.seen.lock().unwrap();
        let second_seen = second.seen.lock().unwrap();
        assert!(!first_seen[0].same_request(&second_seen[0]));
        // One attribute each: neither copy saw the other's mutation.
        for batch in [&first_seen[0], &second_seen[0]] {
            let resource = batch.resource_spans()[0].resource.as_ref().unwrap();
            assert_eq!(resource.attributes.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_errors_are_joined_without_short_circuit() {
        let failing = Arc::new(SinkConsumer::<Traces>::new());
        failing.fail_with(|| ConsumeError::permanent("rejected"));
        let also_failing = Arc::new(SinkConsumer::<Traces>::new());
        also_failing.fail_with(|| ConsumeError::transient("unavailable"));
        let healthy = Arc::new(SinkConsumer::<Traces>::new());

        let fanout = new_fanout(vec![
            failing.clone() as DynConsumer<Traces>,
            also_failing.clone(),
            healthy.clone(),
        ])
        .unwrap();

        let err = fanout
            .consume(&Context::background(), three_spans())
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumeError::Joined(ref errors) if errors.len() == 2));
        assert!(err.is_permanent());
        assert_eq!(healthy.batch_count(), 1);
    }

    #[test]
    fn test_fanout_reports_read_only() {
        let mutator: DynConsumer<Traces> = Arc::new(SinkConsumer::<Traces>::mutating());
        let reader: DynConsumer<Traces> = Arc::new(SinkConsumer::<Traces>::new());
        let fanout = new_fanout(vec![mutator, reader]).unwrap();
        assert!(!fanout.capabilities().mutates_data);
    }
}
