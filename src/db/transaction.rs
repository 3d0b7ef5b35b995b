//! Nested transactions mapped onto SQL savepoints.
//!
//! Each thread keeps, per engine, a stack of active [`TransactionContext`]s.
//! The bottom of the stack is a real transaction (`BEGIN`/`COMMIT`/`ROLLBACK`);
//! every context above it is a savepoint named after its depth
//! (`SAVEPOINT chryso_N`). Since one thread never holds two active contexts
//! at the same depth, the depth alone is a unique savepoint name.
//!
//! [`Transaction`] is the scope guard over a context. Whatever path leaves the
//! scope (explicit resolution, early return, panic) the guard resolves the
//! context if nobody did and pops it from the stack.

use crate::db::connection::Connection;
use crate::db::engine::Engine;
use crate::error::{DbError, DbResult};
use crate::models::{RowSet, SqlParam};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use once_cell::unsync::OnceCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Prefix of every savepoint this crate creates.
pub const SAVEPOINT_PREFIX: &str = "chryso_";

/// How a transaction was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// One (possibly nested) unit of work.
///
/// The parent link is weak: the thread-local stack owns every context, and a
/// parent always outlives its children on that stack.
pub struct TransactionContext {
    id: String,
    parent: Option<Weak<TransactionContext>>,
    outcome: Cell<Option<Outcome>>,
    /// Connection the root context issued `BEGIN` on. Unset on nested contexts.
    connection: OnceCell<Arc<dyn Connection>>,
}

impl TransactionContext {
    fn new(parent: Option<&Rc<TransactionContext>>) -> Rc<Self> {
        Rc::new(Self {
            id: generate_transaction_id(),
            parent: parent.map(Rc::downgrade),
            outcome: Cell::new(None),
            connection: OnceCell::new(),
        })
    }

    /// Unique transaction identifier (`tx_<32 hex>`).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent(&self) -> Option<Rc<TransactionContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Number of ancestors: 0 for a top-level transaction.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(ctx) = current {
            depth += 1;
            current = ctx.parent();
        }
        depth
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.get().is_some()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.get()
    }

    /// Savepoint backing this context, `None` at depth 0.
    pub fn savepoint_name(&self) -> Option<String> {
        match self.depth() {
            0 => None,
            depth => Some(savepoint_name(depth)),
        }
    }

    /// Record the outcome. Returns `false` if it was already resolved.
    fn mark(&self, outcome: Outcome) -> bool {
        if self.is_resolved() {
            return false;
        }
        self.outcome.set(Some(outcome));
        true
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("depth", &self.depth())
            .field("outcome", &self.outcome.get())
            .finish()
    }
}

/// Name of the savepoint used at `depth`.
pub fn savepoint_name(depth: usize) -> String {
    format!("{SAVEPOINT_PREFIX}{depth}")
}

fn begin_sql(depth: usize) -> String {
    match depth {
        0 => "BEGIN".to_string(),
        n => format!("SAVEPOINT {}", savepoint_name(n)),
    }
}

fn resolve_sql(depth: usize, outcome: Outcome) -> String {
    match (depth, outcome) {
        (0, Outcome::Committed) => "COMMIT".to_string(),
        (0, Outcome::RolledBack) => "ROLLBACK".to_string(),
        (n, Outcome::Committed) => format!("RELEASE SAVEPOINT {}", savepoint_name(n)),
        (n, Outcome::RolledBack) => format!("ROLLBACK TO SAVEPOINT {}", savepoint_name(n)),
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Per-thread transaction stacks, keyed by engine id.
mod stack {
    use super::*;

    thread_local! {
        static STACKS: RefCell<HashMap<u64, Vec<Rc<TransactionContext>>>> =
            RefCell::new(HashMap::new());
    }

    pub(super) fn top(engine_id: u64) -> Option<Rc<TransactionContext>> {
        STACKS
            .try_with(|stacks| {
                stacks
                    .borrow()
                    .get(&engine_id)
                    .and_then(|stack| stack.last().cloned())
            })
            .ok()
            .flatten()
    }

    pub(super) fn root(engine_id: u64) -> Option<Rc<TransactionContext>> {
        STACKS
            .try_with(|stacks| {
                stacks
                    .borrow()
                    .get(&engine_id)
                    .and_then(|stack| stack.first().cloned())
            })
            .ok()
            .flatten()
    }

    pub(super) fn len(engine_id: u64) -> usize {
        STACKS
            .try_with(|stacks| stacks.borrow().get(&engine_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    pub(super) fn push(engine_id: u64, ctx: Rc<TransactionContext>) {
        // Pushing happens while the thread is alive and running user code,
        // so the thread-local is always accessible here.
        STACKS.with(|stacks| stacks.borrow_mut().entry(engine_id).or_default().push(ctx));
    }

    pub(super) fn is_top(engine_id: u64, ctx: &Rc<TransactionContext>) -> bool {
        top(engine_id).is_some_and(|top| Rc::ptr_eq(&top, ctx))
    }

    /// Remove every context stacked above `ctx`, returning them innermost first.
    pub(super) fn truncate_above(
        engine_id: u64,
        ctx: &Rc<TransactionContext>,
    ) -> Vec<Rc<TransactionContext>> {
        STACKS
            .try_with(|stacks| {
                let mut stacks = stacks.borrow_mut();
                let Some(stack) = stacks.get_mut(&engine_id) else {
                    return Vec::new();
                };
                match stack.iter().position(|c| Rc::ptr_eq(c, ctx)) {
                    Some(pos) => {
                        let mut above = stack.split_off(pos + 1);
                        above.reverse();
                        above
                    }
                    None => Vec::new(),
                }
            })
            .unwrap_or_default()
    }

    /// Remove `ctx` if it is the top of its stack.
    pub(super) fn pop(engine_id: u64, ctx: &Rc<TransactionContext>) {
        let _ = STACKS.try_with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            if let Some(stack) = stacks.get_mut(&engine_id) {
                if stack.last().is_some_and(|top| Rc::ptr_eq(top, ctx)) {
                    stack.pop();
                }
                if stack.is_empty() {
                    stacks.remove(&engine_id);
                }
            }
        });
    }
}

/// Depth of the current transaction on this thread, if any.
pub(crate) fn current_depth(engine_id: u64) -> Option<usize> {
    stack::len(engine_id).checked_sub(1)
}

/// Connection the open transaction on this thread is bound to, with the id of
/// its root context.
pub(crate) fn pinned_connection(engine_id: u64) -> Option<(String, Arc<dyn Connection>)> {
    let root = stack::root(engine_id)?;
    let conn = root.connection.get()?;
    Some((root.id.clone(), Arc::clone(conn)))
}

/// Scope guard over one [`TransactionContext`].
///
/// Obtained from [`Engine::begin`] or handed to the closure of
/// [`Engine::atomic`]. Dropping an unresolved guard rolls it back. Not `Send`:
/// a transaction lives and dies on the thread that opened it.
pub struct Transaction<'e> {
    engine: &'e Engine,
    ctx: Rc<TransactionContext>,
    depth: usize,
}

impl<'e> Transaction<'e> {
    /// Push a new context onto the calling thread's stack and open it.
    pub(crate) fn begin(engine: &'e Engine) -> DbResult<Self> {
        let engine_id = engine.id();
        let parent = stack::top(engine_id);

        if let Some(parent) = &parent {
            if let Some(outcome) = parent.outcome() {
                return Err(DbError::transaction_state(
                    format!("Cannot open a nested transaction inside one already {outcome}"),
                    parent.id(),
                ));
            }
        }

        let ctx = TransactionContext::new(parent.as_ref());
        if parent.is_none() {
            // Every statement of this transaction must reach this connection.
            let conn = engine.pool().acquire()?;
            let _ = ctx.connection.set(conn);
        }
        let depth = ctx.depth();
        debug_assert_eq!(depth, stack::len(engine_id));
        stack::push(engine_id, Rc::clone(&ctx));

        let tx = Self { engine, ctx, depth };

        if let Err(e) = engine.execute(&begin_sql(depth), &[]) {
            // Nothing was opened; let Drop just pop the context.
            tx.ctx.mark(Outcome::RolledBack);
            return Err(e);
        }

        debug!(
            transaction_id = %tx.ctx.id(),
            depth = depth,
            "Transaction started"
        );

        Ok(tx)
    }

    pub fn id(&self) -> &str {
        self.ctx.id()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn context(&self) -> &TransactionContext {
        &self.ctx
    }

    pub fn is_active(&self) -> bool {
        !self.ctx.is_resolved()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.ctx.outcome()
    }

    pub fn savepoint_name(&self) -> Option<String> {
        (self.depth > 0).then(|| savepoint_name(self.depth))
    }

    /// Execute a statement on this thread's connection.
    pub fn execute(&self, sql: &str, params: &[SqlParam]) -> DbResult<RowSet> {
        self.engine.execute(sql, params)
    }

    /// Open a nested unit of work; see [`Engine::atomic`].
    pub fn atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'e>) -> Result<T, E>,
        E: From<DbError>,
    {
        self.engine.atomic(f)
    }

    /// Commit (or release the savepoint of) this transaction.
    pub fn commit(&self) -> DbResult<()> {
        self.resolve(Outcome::Committed)
    }

    /// Roll back this transaction, or back to its savepoint.
    pub fn rollback(&self) -> DbResult<()> {
        self.resolve(Outcome::RolledBack)
    }

    fn resolve(&self, outcome: Outcome) -> DbResult<()> {
        if let Some(previous) = self.ctx.outcome() {
            return Err(DbError::transaction_state(
                format!("Transaction already {previous}"),
                self.ctx.id(),
            ));
        }
        if !stack::is_top(self.engine.id(), &self.ctx) {
            return Err(DbError::transaction_state(
                "Cannot resolve a transaction while a nested transaction is still open",
                self.ctx.id(),
            ));
        }

        // The single resolution happens here, even if the statement fails.
        self.ctx.mark(outcome);
        self.engine.execute(&resolve_sql(self.depth, outcome), &[])?;

        debug!(
            transaction_id = %self.ctx.id(),
            depth = self.depth,
            outcome = %outcome,
            "Transaction resolved"
        );

        Ok(())
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.ctx.id())
            .field("depth", &self.depth)
            .field("outcome", &self.ctx.outcome())
            .finish_non_exhaustive()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let engine_id = self.engine.id();

        // An outer guard dropped while inner ones are still open takes them
        // with it; rolling back the outer scope discards their work anyway.
        for orphan in stack::truncate_above(engine_id, &self.ctx) {
            orphan.mark(Outcome::RolledBack);
            error!(
                transaction_id = %orphan.id(),
                parent_id = %self.ctx.id(),
                "Nested transaction still open when its parent scope ended"
            );
        }

        if self.is_active() {
            if !std::thread::panicking() {
                warn!(
                    transaction_id = %self.ctx.id(),
                    depth = self.depth,
                    "Transaction dropped without commit or rollback, rolling back"
                );
            }
            if let Err(e) = self.resolve(Outcome::RolledBack) {
                warn!(
                    transaction_id = %self.ctx.id(),
                    error = %e,
                    "Rollback on scope exit failed"
                );
            }
        }

        stack::pop(engine_id, &self.ctx);
    }
}
