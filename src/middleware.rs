// Copyright (c) 2025, The Courier Authors
// MIT License
// All rights reserved.

//! # Middleware Chain
//!
//! Middlewares wrap the terminal handler in registration order: the first
//! registered runs first. A middleware that never invokes [`Next::run`]
//! short-circuits the rest of the chain, including the handler; that is not
//! an error. Any error aborts the chain and surfaces to the dispatcher,
//! which makes the retry/DLQ decision.

use crate::errors::ClientError;
use crate::handler::{HandlerContext, MessageHandler, Replier};
use async_trait::async_trait;
use std::sync::Arc;

/// A single middleware layer.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        next: Next<'_>,
        reply: &Replier,
    ) -> Result<(), ClientError>;
}

/// Continuation into the remainder of the chain.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    handler: &'a Arc<dyn MessageHandler>,
}

impl<'a> Next<'a> {
    /// Invokes the next middleware, or the terminal handler at the tail.
    pub async fn run(self, ctx: &HandlerContext, reply: &Replier) -> Result<(), ClientError> {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                head.handle(
                    ctx,
                    Next {
                        middlewares: rest,
                        handler: self.handler,
                    },
                    reply,
                )
                .await
            }
            None => self.handler.handle(ctx, reply).await,
        }
    }
}

/// Runs `ctx` through `middlewares` and then `handler`.
pub async fn run_chain(
    middlewares: &[Arc<dyn Middleware>],
    handler: &Arc<dyn MessageHandler>,
    ctx: &HandlerContext,
    reply: &Replier,
) -> Result<(), ClientError> {
    Next {
        middlewares,
        handler,
    }
    .run(ctx, reply)
    .await
}
