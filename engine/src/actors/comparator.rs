//! ComparatorActor - message-driven front door to the comparison engine.
//!
//! Each `RunComparison` spawns its pipeline onto the runtime and replies
//! from the spawned task, so the actor loop stays responsive to `Cancel`
//! while runs are in flight. The actor tracks one cancellation token per
//! run id and drops it when the run settles.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use shared_types::{ComparisonRequest, SynthesisResult};

use crate::backend::{NarrativeBackend, RetrievalBackend};
use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::pipeline::ComparisonEngine;

#[derive(Debug, Default)]
pub struct ComparatorActor;

pub struct ComparatorArguments {
    pub retrieval: Arc<dyn RetrievalBackend>,
    pub narrative: Arc<dyn NarrativeBackend>,
    pub config: EngineConfig,
}

pub struct ComparatorState {
    engine: Arc<ComparisonEngine>,
    runs: HashMap<String, CancellationToken>,
}

pub enum ComparatorMsg {
    RunComparison {
        request: ComparisonRequest,
        /// Caller-supplied handle for later cancellation; generated
        /// when absent.
        run_id: Option<String>,
        reply: RpcReplyPort<Result<SynthesisResult, PipelineError>>,
    },
    Cancel {
        run_id: String,
    },
    /// Internal: a spawned run settled; forget its token.
    RunFinished {
        run_id: String,
    },
}

#[async_trait]
impl Actor for ComparatorActor {
    type Msg = ComparatorMsg;
    type State = ComparatorState;
    type Arguments = ComparatorArguments;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(ComparatorState {
            engine: Arc::new(ComparisonEngine::new(
                args.retrieval,
                args.narrative,
                args.config,
            )),
            runs: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ComparatorMsg::RunComparison {
                request,
                run_id,
                reply,
            } => {
                let run_id = run_id.unwrap_or_else(|| Ulid::new().to_string());
                let cancel = CancellationToken::new();
                state.runs.insert(run_id.clone(), cancel.clone());

                let engine = Arc::clone(&state.engine);
                tokio::spawn(async move {
                    let result = engine.run_cancellable(&request, cancel).await;
                    let _ = reply.send(result);
                    let _ = myself.cast(ComparatorMsg::RunFinished { run_id });
                });
            }
            ComparatorMsg::Cancel { run_id } => {
                if let Some(cancel) = state.runs.get(&run_id) {
                    tracing::info!(run_id = %run_id, "cancelling comparison run");
                    cancel.cancel();
                } else {
                    tracing::debug!(run_id = %run_id, "cancel for unknown or settled run");
                }
            }
            ComparatorMsg::RunFinished { run_id } => {
                state.runs.remove(&run_id);
            }
        }
        Ok(())
    }
}
