//! Promise job queue for one environment
//!
//! The interpreter enqueues reaction jobs here instead of running them
//! itself. The event loop takes them one at a time with [`JobQueue::run_next`]
//! and checks the deadline in between, so code that keeps queueing jobs
//! cannot hold the worker past it.

use boa_engine::job::{Job, JobExecutor, PromiseJob};
use boa_engine::{Context, JsResult};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::debug;

#[derive(Default)]
pub(crate) struct JobQueue {
    promise_jobs: RefCell<VecDeque<PromiseJob>>,
}

impl JobQueue {
    /// Run the oldest pending job. `None` when nothing is queued.
    ///
    /// An `Err` is an error no script code could catch (a runtime limit).
    pub fn run_next(&self, context: &mut Context) -> Option<JsResult<()>> {
        let job = self.promise_jobs.borrow_mut().pop_front()?;
        Some(job.call(context).map(|_| ()))
    }

    pub fn len(&self) -> usize {
        self.promise_jobs.borrow().len()
    }
}

impl JobExecutor for JobQueue {
    fn enqueue_job(self: Rc<Self>, job: Job, _context: &mut Context) {
        match job {
            Job::PromiseJob(job) => self.promise_jobs.borrow_mut().push_back(job),
            // Nothing inside the sandbox schedules host timeouts or async jobs
            _ => debug!("discarding non-promise job"),
        }
    }

    fn run_jobs(self: Rc<Self>, context: &mut Context) -> JsResult<()> {
        while let Some(result) = self.run_next(context) {
            result?;
        }
        Ok(())
    }
}
