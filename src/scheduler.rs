// Copyright (c) 2024-2025, The tinyvvc contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License.
// If the BSD 2 Clause License was not distributed with this source code
// in the LICENSE file, you can obtain it at
// www.opensource.org/licenses/bsd-license.php

// Job scheduler.
//
// A fixed pool of worker threads drains one shared queue. Jobs carry an
// atomic count of unfinished predecessors plus one "submission token";
// whoever drops the count to zero (the submitting thread or the last
// finishing predecessor) pushes the job into the queue. Every edge is
// explicit: nothing about ordering is inferred from submission order.
//
// Jobs run exactly once and are never cancelled. A panic inside a job
// poisons nothing here but leaves the owning frame unusable, which
// matches the contract that a failed job invalidates the encoder state.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
  Pending,
  Ready,
  Running,
  Done,
}

struct JobState {
  phase: JobPhase,
  successors: Vec<Job>,
}

struct JobInner {
  task: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
  // Unfinished predecessors plus one submission token
  pending: AtomicUsize,
  submitted: AtomicBool,
  state: Mutex<JobState>,
  cond: Condvar,
  name: &'static str,
}

#[derive(Clone)]
pub struct Job {
  inner: Arc<JobInner>,
}

impl Job {
  pub fn new<F: FnOnce() + Send + 'static>(name: &'static str, f: F) -> Job {
    Job {
      inner: Arc::new(JobInner {
        task: Mutex::new(Some(Box::new(f))),
        pending: AtomicUsize::new(1),
        submitted: AtomicBool::new(false),
        state: Mutex::new(JobState { phase: JobPhase::Pending, successors: Vec::new() }),
        cond: Condvar::new(),
        name: name,
      }),
    }
  }

  /// Make `self` wait for `dep`. Must be called before `self` is
  /// submitted; adding edges to a live job is a contract violation.
  pub fn depend_on(&self, dep: &Job) {
    assert!(
      !self.inner.submitted.load(Ordering::SeqCst),
      "dependency added to an already submitted job"
    );

    let mut dep_state = dep.inner.state.lock().unwrap();
    if dep_state.phase == JobPhase::Done {
      return;
    }
    self.inner.pending.fetch_add(1, Ordering::SeqCst);
    dep_state.successors.push(self.clone());
  }

  pub fn is_done(&self) -> bool {
    self.inner.state.lock().unwrap().phase == JobPhase::Done
  }

  /// Block until the job has run.
  pub fn wait(&self) {
    let mut state = self.inner.state.lock().unwrap();
    while state.phase != JobPhase::Done {
      state = self.inner.cond.wait(state).unwrap();
    }
  }

  fn release_token(&self, queue: &Sender<Job>) {
    if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
      {
        let mut state = self.inner.state.lock().unwrap();
        debug_assert!(state.phase == JobPhase::Pending);
        state.phase = JobPhase::Ready;
      }
      trace!("job {} ready", self.inner.name);
      // The queue only closes after all jobs have drained.
      let _ = queue.send(self.clone());
    }
  }

  fn run(&self, queue: &Sender<Job>) {
    let task = {
      let mut state = self.inner.state.lock().unwrap();
      assert!(state.phase == JobPhase::Ready, "job {} ran twice", self.inner.name);
      state.phase = JobPhase::Running;
      self.inner.task.lock().unwrap().take()
    };

    if let Some(task) = task {
      task();
    }

    let successors = {
      let mut state = self.inner.state.lock().unwrap();
      state.phase = JobPhase::Done;
      self.inner.cond.notify_all();
      std::mem::take(&mut state.successors)
    };
    trace!("job {} done, releasing {} successors", self.inner.name, successors.len());

    for succ in successors {
      succ.release_token(queue);
    }
  }
}

pub struct Scheduler {
  sender: Option<Sender<Job>>,
  workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
  pub fn new(num_threads: usize) -> Scheduler {
    assert!(num_threads > 0);
    let (sender, receiver): (Sender<Job>, Receiver<Job>) = unbounded();

    let workers = (0..num_threads)
      .map(|i| {
        let rx = receiver.clone();
        let tx = sender.clone();
        std::thread::Builder::new()
          .name(format!("tinyvvc-worker-{}", i))
          .spawn(move || {
            while let Ok(job) = rx.recv() {
              job.run(&tx);
            }
          })
          .expect("spawning a worker thread")
      })
      .collect();

    Scheduler { sender: Some(sender), workers: workers }
  }

  /// Hand the job to the pool. It becomes runnable once every dependency
  /// added through depend_on() has finished.
  pub fn submit(&self, job: &Job) {
    let was = job.inner.submitted.swap(true, Ordering::SeqCst);
    assert!(!was, "job {} submitted twice", job.inner.name);
    job.release_token(self.sender.as_ref().unwrap());
  }
}

impl Drop for Scheduler {
  fn drop(&mut self) {
    // Closing the channel stops the workers once the queue is empty.
    self.sender.take();
    for w in self.workers.drain(..) {
      let _ = w.join();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;

  #[test]
  fn jobs_run_after_their_predecessors() {
    let sched = Scheduler::new(4);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mk = |id: u32, order: &Arc<Mutex<Vec<u32>>>| {
      let order = order.clone();
      Job::new("test", move || order.lock().unwrap().push(id))
    };

    // Chain with a diamond in the middle: 0 -> {1, 2} -> 3
    let j0 = mk(0, &order);
    let j1 = mk(1, &order);
    let j2 = mk(2, &order);
    let j3 = mk(3, &order);
    j1.depend_on(&j0);
    j2.depend_on(&j0);
    j3.depend_on(&j1);
    j3.depend_on(&j2);

    // Submit in a hostile order; edges alone must produce the ordering
    sched.submit(&j3);
    sched.submit(&j1);
    sched.submit(&j2);
    sched.submit(&j0);
    j3.wait();

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], 0);
    assert_eq!(order[3], 3);
  }

  #[test]
  fn every_job_runs_exactly_once() {
    let sched = Scheduler::new(8);
    let count = Arc::new(AtomicU32::new(0));
    let mut jobs = Vec::new();

    for i in 0..500 {
      let count = count.clone();
      let job = Job::new("count", move || {
        count.fetch_add(1, Ordering::SeqCst);
      });
      // Random-ish sprinkling of dependencies on earlier jobs
      if i > 0 && i % 3 != 0 {
        let prev: &Job = &jobs[i / 2];
        job.depend_on(prev);
      }
      jobs.push(job);
    }
    for job in &jobs {
      sched.submit(job);
    }
    for job in &jobs {
      job.wait();
    }
    assert_eq!(count.load(Ordering::SeqCst), 500);
  }

  #[test]
  fn depending_on_a_done_job_is_a_no_op() {
    let sched = Scheduler::new(2);
    let first = Job::new("first", || {});
    sched.submit(&first);
    first.wait();

    let ran = Arc::new(AtomicU32::new(0));
    let ran2 = ran.clone();
    let second = Job::new("second", move || {
      ran2.fetch_add(1, Ordering::SeqCst);
    });
    second.depend_on(&first);
    sched.submit(&second);
    second.wait();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
  }
}
