//! A bounded thread pool that runs a closure on each item sent to it.
//!
//! First-error-wins: once one worker's closure returns an error, the
//! abort slot is set and further sends fail fast; other workers finish
//! whatever they already dequeued but stop looking for new input once
//! the channel is dropped. This backs every bounded worker pool named in
//! spec §5 (indexer validation pool, sync download/upload pools, repair
//! re-upload pool).

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, Sender};

/// A handle to send data to the worker threads (implements `Clone`).
pub struct SendHandle<I> {
    input: Sender<I>,
    abort: Arc<Mutex<Option<String>>>,
}

/// Returns the first error observed by any worker, if any.
pub fn check_abort(abort: &Mutex<Option<String>>) -> Result<(), Error> {
    let guard = abort.lock().unwrap();
    if let Some(err_msg) = &*guard {
        return Err(format_err!("{}", err_msg));
    }
    Ok(())
}

impl<I: Send> SendHandle<I> {
    pub fn send(&self, input: I) -> Result<(), Error> {
        check_abort(&self.abort)?;
        match self.input.send(input) {
            Ok(()) => Ok(()),
            Err(_) => bail!("send failed - channel closed"),
        }
    }
}

impl<I> Clone for SendHandle<I> {
    fn clone(&self) -> Self {
        Self {
            input: self.input.clone(),
            abort: Arc::clone(&self.abort),
        }
    }
}

/// A pool of `threads` workers, each running `handler_fn` on whatever is
/// sent to them. Call `complete()` when done to join and check for
/// outstanding errors.
pub struct ParallelHandler<I> {
    handles: Vec<JoinHandle<()>>,
    name: String,
    input: Option<SendHandle<I>>,
}

impl<I: Send + 'static> ParallelHandler<I> {
    pub fn new<F>(name: &str, threads: usize, handler_fn: F) -> Self
    where
        F: Fn(I) -> Result<(), Error> + Send + Clone + 'static,
    {
        let mut handles = Vec::new();
        let (input_tx, input_rx) = bounded::<I>(threads.max(1));

        let abort = Arc::new(Mutex::new(None));

        for i in 0..threads.max(1) {
            let input_rx = input_rx.clone();
            let abort = Arc::clone(&abort);
            let handler_fn = handler_fn.clone();

            handles.push(
                std::thread::Builder::new()
                    .name(format!("{name} ({i})"))
                    .spawn(move || loop {
                        let data = match input_rx.recv() {
                            Ok(data) => data,
                            Err(_) => return,
                        };
                        if let Err(err) = (handler_fn)(data) {
                            let mut guard = abort.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(err.to_string());
                            }
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
        Self {
            handles,
            name: name.to_string(),
            input: Some(SendHandle {
                input: input_tx,
                abort,
            }),
        }
    }

    pub fn channel(&self) -> SendHandle<I> {
        self.input.as_ref().unwrap().clone()
    }

    pub fn send(&self, input: I) -> Result<(), Error> {
        self.input.as_ref().unwrap().send(input)?;
        Ok(())
    }

    pub fn complete(mut self) -> Result<(), Error> {
        let input = self.input.take().unwrap();
        let abort = Arc::clone(&input.abort);
        check_abort(&abort)?;
        drop(input);

        let msg_list = self.join_threads();

        check_abort(&abort)?;

        if msg_list.is_empty() {
            return Ok(());
        }
        Err(format_err!("{}", msg_list.join("\n")))
    }

    fn join_threads(&mut self) -> Vec<String> {
        let mut msg_list = Vec::new();
        let mut i = 0;
        while let Some(handle) = self.handles.pop() {
            if let Err(panic) = handle.join() {
                match panic.downcast::<&str>() {
                    Ok(panic_msg) => msg_list.push(format!(
                        "thread {} ({}) panicked: {}",
                        self.name, i, panic_msg
                    )),
                    Err(_) => msg_list.push(format!("thread {} ({}) panicked", self.name, i)),
                }
            }
            i += 1;
        }
        msg_list
    }
}

impl<I> Drop for ParallelHandler<I> {
    fn drop(&mut self) {
        drop(self.input.take());
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_items() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::clone(&counter);
        let pool = ParallelHandler::new("test", 4, move |_: ()| {
            counter2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        for _ in 0..100 {
            pool.send(()).unwrap();
        }
        pool.complete().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn first_error_wins() {
        let pool = ParallelHandler::new("test", 2, |i: i32| {
            if i == 3 {
                bail!("boom");
            }
            Ok(())
        });
        for i in 0..10 {
            if pool.send(i).is_err() {
                break;
            }
        }
        assert!(pool.complete().is_err());
    }
}
