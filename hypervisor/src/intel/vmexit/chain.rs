//! Ordered handler chains.
//!
//! A chain holds the handlers registered for one exit category. New handlers
//! are placed in front of older ones, and dispatch stops at the first handler
//! that claims the exit, so late, more specific policy overrides earlier,
//! generic policy.

use {
    crate::intel::vmexit::ExitContext,
    alloc::{boxed::Box, collections::VecDeque},
};

/// A handler registered into a [`HandlerChain`].
///
/// Receives the live exit context and the per-exit descriptor `I`; returns
/// `true` to claim the exit.
pub type Handler<I> = Box<dyn FnMut(&mut ExitContext<'_>, &mut I) -> bool>;

pub struct HandlerChain<I> {
    handlers: VecDeque<Handler<I>>,
}

impl<I> HandlerChain<I> {
    pub const fn new() -> Self {
        Self { handlers: VecDeque::new() }
    }

    /// Inserts `handler` at the front of the chain.
    pub fn register<F>(&mut self, handler: F)
    where
        F: FnMut(&mut ExitContext<'_>, &mut I) -> bool + 'static,
    {
        self.handlers.push_front(Box::new(handler));
    }

    /// Runs the handlers front to back until one claims the exit.
    ///
    /// Returns `false` when every handler declined or the chain is empty.
    pub fn dispatch(&mut self, ctx: &mut ExitContext<'_>, info: &mut I) -> bool {
        self.handlers.iter_mut().any(|handler| handler(ctx, info))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<I> Default for HandlerChain<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::{capture::GuestRegisters, vmcs::mock::MockVmcs},
        std::{cell::RefCell, rc::Rc, vec::Vec},
    };

    fn dispatch(chain: &mut HandlerChain<u64>, info: &mut u64) -> bool {
        let mut vmcs = MockVmcs::default();
        let mut regs = GuestRegisters::default();
        let mut ctx = ExitContext::new(&mut vmcs, &mut regs);
        chain.dispatch(&mut ctx, info)
    }

    #[test]
    fn test_empty_chain_declines() {
        let mut chain = HandlerChain::<u64>::new();
        assert!(chain.is_empty());
        assert!(!dispatch(&mut chain, &mut 0));
    }

    #[test]
    fn test_last_registered_runs_first() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut chain = HandlerChain::<u64>::new();

        let log = calls.clone();
        chain.register(move |_, info| {
            log.borrow_mut().push("h1");
            *info = 1;
            true
        });

        let log = calls.clone();
        chain.register(move |_, _| {
            log.borrow_mut().push("h2");
            false
        });

        let mut info = 0;
        assert!(dispatch(&mut chain, &mut info));
        assert_eq!(*calls.borrow(), ["h2", "h1"]);
        assert_eq!(info, 1);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_dispatch_stops_at_first_claim() {
        let h1_ran = Rc::new(RefCell::new(false));
        let mut chain = HandlerChain::<u64>::new();

        let flag = h1_ran.clone();
        chain.register(move |_, _| {
            *flag.borrow_mut() = true;
            true
        });
        chain.register(|_, _| true);

        assert!(dispatch(&mut chain, &mut 0));
        assert!(!*h1_ran.borrow());
    }

    #[test]
    fn test_all_declining_handlers_run() {
        let count = Rc::new(RefCell::new(0));
        let mut chain = HandlerChain::<u64>::new();

        for _ in 0..3 {
            let count = count.clone();
            chain.register(move |_, _| {
                *count.borrow_mut() += 1;
                false
            });
        }

        assert!(!dispatch(&mut chain, &mut 0));
        assert_eq!(*count.borrow(), 3);
    }
}
