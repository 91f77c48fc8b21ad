//! The state kernel: runs a single command/query/stream-start invocation
//! against a draft and finalizes it into a patch.

use serde::{de::DeserializeOwned, Serialize};

use crate::definition::{ChunkSender, Context, EntityDefinition, HandlerEntry};
use crate::error::{RichError, RuntimeError};
use crate::patch::{Draft, Patch};
use crate::rich::RichValue;

/// The result of running a command: the patch observed (empty if the
/// handler didn't mutate the draft), the resulting state, and the
/// handler's return value.
pub struct CommandOutcome<S> {
    pub patch: Patch,
    pub state: S,
    pub result: RichValue,
}

/// Opens a draft over `state`, runs `name` as a command, and finalizes it.
/// On handler error the draft is dropped unfinalized, so `state` is left
/// untouched by the caller.
pub async fn apply_command<S>(
    def: &EntityDefinition<S>,
    state: &S,
    name: &str,
    args: Vec<RichValue>,
    ctx: &Context,
) -> Result<CommandOutcome<S>, RuntimeError>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    let handler = match def.handler(name) {
        Some(HandlerEntry::Command(h)) => h.clone(),
        Some(_) => return Err(RuntimeError::NotACommand(name.to_string())),
        None => return Err(RuntimeError::UnknownHandler(name.to_string())),
    };
    let mut draft = Draft::new(state).map_err(RuntimeError::Rich)?;
    let result = handler
        .call(&mut draft, args, ctx)
        .await
        .map_err(RuntimeError::Handler)?;
    let (patch, next_state) = draft.finish().map_err(RuntimeError::Rich)?;
    Ok(CommandOutcome {
        patch,
        state: next_state,
        result,
    })
}

/// Runs `name` as a query against a read-only draft over `state`. Any
/// mutation the handler makes to the draft is discarded; only its return
/// value is observed.
pub async fn run_query<S>(
    def: &EntityDefinition<S>,
    state: &S,
    name: &str,
    args: Vec<RichValue>,
    ctx: &Context,
) -> Result<RichValue, RuntimeError>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    let handler = match def.handler(name) {
        Some(HandlerEntry::Query(h)) => h.clone(),
        Some(_) => return Err(RuntimeError::NotAQuery(name.to_string())),
        None => return Err(RuntimeError::UnknownHandler(name.to_string())),
    };
    let mut draft = Draft::new(state).map_err(RuntimeError::Rich)?;
    let result = handler
        .call(&mut draft, args, ctx)
        .await
        .map_err(RuntimeError::Handler)?;
    Ok(result)
}

/// Outcome of a stream invocation: the patch/state from however the
/// generator mutated the draft over its lifetime, plus the final value it
/// returned once exhausted.
pub struct StreamOutcome<S> {
    pub patch: Patch,
    pub state: S,
    pub result: RichValue,
}

/// Starts a stream handler, forwarding chunks to `emit` as they're
/// produced, finalizing the draft once the handler's future completes.
pub async fn start_stream<S>(
    def: &EntityDefinition<S>,
    state: &S,
    name: &str,
    args: Vec<RichValue>,
    ctx: &Context,
    emit: ChunkSender,
) -> Result<StreamOutcome<S>, RuntimeError>
where
    S: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    let handler = match def.handler(name) {
        Some(HandlerEntry::Stream(h)) => h.clone(),
        Some(_) => return Err(RuntimeError::NotAStream(name.to_string())),
        None => return Err(RuntimeError::UnknownHandler(name.to_string())),
    };
    let mut draft = Draft::new(state).map_err(RuntimeError::Rich)?;
    let result = handler
        .call(&mut draft, args, ctx, emit)
        .await
        .map_err(RuntimeError::Handler)?;
    let (patch, next_state) = draft.finish().map_err(RuntimeError::Rich)?;
    Ok(StreamOutcome {
        patch,
        state: next_state,
        result,
    })
}

/// Decodes a `RichValue` state snapshot into the definition's current
/// schema type, surfacing a `RichError` rather than panicking on shape
/// mismatch (used by hydration once upcasting reaches the current
/// version).
pub fn decode_state<S: DeserializeOwned>(value: &RichValue) -> Result<S, RichError> {
    crate::rich::from_rich(value)
}
