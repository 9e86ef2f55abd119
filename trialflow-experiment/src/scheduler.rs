//! Cooperative, frame-paced task scheduler.
//!
//! Tasks are step functions returning an [`Event`] or owned child schedulers.
//! The host drives the root scheduler once per display refresh; each step runs
//! tasks until one of them asks for a screen flip or the root quits.

use anyhow::{Result, anyhow};
use log::{debug, info};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use trialflow_timing::FrameDriver;

/// Control signal returned by every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Move on to the following task.
    Next,
    /// Move on, but present a flip before the following task runs.
    FlipNext,
    /// Run the same task again on the next frame, after a flip.
    FlipRepeat,
    /// Terminate this scheduler; remaining tasks are not run.
    Quit,
}

impl Event {
    pub fn requests_flip(self) -> bool {
        matches!(self, Event::FlipNext | Event::FlipRepeat)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Running,
}

/// Experiment-wide flag shared by every scheduler of one tree.
///
/// While the session is live a child scheduler that quits simply hands
/// control back to its parent; once ended, the quit travels up to the root.
#[derive(Debug, Clone, Default)]
pub struct Session {
    ended: Rc<Cell<bool>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn end(&self) {
        self.ended.set(true);
    }

    pub fn has_ended(&self) -> bool {
        self.ended.get()
    }
}

/// Cloneable cancellation flag of a scheduler.
///
/// Tasks can hold one and stop the scheduler that is running them; the stop
/// takes effect at the next task boundary anywhere in the tree.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Rc<Cell<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.requested.set(true);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.get()
    }
}

pub type StepFn = Box<dyn FnMut() -> Result<Event>>;

pub enum Task {
    Step(StepFn),
    Nested(Scheduler),
    Conditional(Conditional),
}

impl Task {
    pub fn step<F>(f: F) -> Self
    where
        F: FnMut() -> Result<Event> + 'static,
    {
        Task::Step(Box::new(f))
    }
}

impl From<Scheduler> for Task {
    fn from(scheduler: Scheduler) -> Self {
        Task::Nested(scheduler)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Step(_) => f.write_str("Step"),
            Task::Nested(s) => write!(f, "Nested({})", s.name),
            Task::Conditional(c) => write!(f, "Conditional(taken: {:?})", c.taken),
        }
    }
}

/// Decision point: the condition runs once, the chosen branch runs in its place.
pub struct Conditional {
    condition: Box<dyn FnMut() -> bool>,
    then_branch: Scheduler,
    else_branch: Scheduler,
    taken: Option<bool>,
}

impl Conditional {
    fn branch_mut(&mut self) -> Option<&mut Scheduler> {
        match self.taken? {
            true => Some(&mut self.then_branch),
            false => Some(&mut self.else_branch),
        }
    }
}

enum Visit {
    Ran(Event),
    Descend,
    Quit,
    /// The root was stopped before a new task could start.
    Stopped,
}

pub struct Scheduler {
    name: String,
    session: Session,
    tasks: Vec<Task>,
    cursor: usize,
    /// The task under the cursor has started: a step function mid-repeat or
    /// a child scheduler in progress.
    entered: bool,
    status: Status,
    stop: StopHandle,
    flips_requested: usize,
}

impl Scheduler {
    pub fn new(session: &Session) -> Self {
        Self::named("scheduler", session)
    }

    pub fn named(name: impl Into<String>, session: &Session) -> Self {
        Self {
            name: name.into(),
            session: session.clone(),
            tasks: Vec::new(),
            cursor: 0,
            entered: false,
            status: Status::Stopped,
            stop: StopHandle::default(),
            flips_requested: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Flips asked for by tasks since this scheduler was created.
    pub fn flips_requested(&self) -> usize {
        self.flips_requested
    }

    pub fn add(&mut self, task: impl Into<Task>) -> &mut Self {
        self.tasks.push(task.into());
        self
    }

    pub fn add_task<F>(&mut self, f: F) -> &mut Self
    where
        F: FnMut() -> Result<Event> + 'static,
    {
        self.add(Task::step(f))
    }

    pub fn add_scheduler(&mut self, child: Scheduler) -> &mut Self {
        self.add(Task::Nested(child))
    }

    pub fn add_conditional<C>(
        &mut self,
        condition: C,
        then_scheduler: Scheduler,
        else_scheduler: Scheduler,
    ) -> &mut Self
    where
        C: FnMut() -> bool + 'static,
    {
        self.add(Task::Conditional(Conditional {
            condition: Box::new(condition),
            then_branch: then_scheduler,
            else_branch: else_scheduler,
            taken: None,
        }))
    }

    /// Stops before the next task is started, at any nesting depth. A task
    /// that is repeating is never interrupted.
    pub fn stop(&self) {
        debug!("{}: stop requested", self.name);
        self.stop.stop();
    }

    /// Handle for stopping this scheduler from inside one of its tasks.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Runs tasks until one requests a flip or the scheduler quits.
    ///
    /// Returns `FlipNext`/`FlipRepeat` when the host should present a frame
    /// and call again, `Quit` once this scheduler has stopped. Task errors
    /// stop the scheduler and are returned unchanged.
    pub fn step(&mut self) -> Result<Event> {
        let mut depth = 0;
        loop {
            let root_stopped = self.stop.is_requested();
            let visit = match self.frame_mut(depth)?.visit(root_stopped) {
                Ok(visit) => visit,
                Err(err) => {
                    self.status = Status::Stopped;
                    return Err(err);
                }
            };

            match visit {
                Visit::Descend => depth += 1,
                Visit::Ran(event) => {
                    self.frame_mut(depth)?.complete_task(event);
                    match event {
                        Event::Next => {}
                        Event::FlipNext | Event::FlipRepeat => {
                            self.flips_requested += 1;
                            return Ok(event);
                        }
                        Event::Quit => match self.unwind(depth)? {
                            Some(resume) => depth = resume,
                            None => return Ok(Event::Quit),
                        },
                    }
                }
                Visit::Quit => match self.unwind(depth)? {
                    Some(resume) => depth = resume,
                    None => return Ok(Event::Quit),
                },
                Visit::Stopped => {
                    for level in (0..depth).rev() {
                        self.frame_mut(level)?.complete_task(Event::Quit);
                    }
                    info!("{}: stopped", self.name);
                    return Ok(Event::Quit);
                }
            }
        }
    }

    /// Runs the whole tree to completion, counting flip requests instead of
    /// waiting for frames. Always returns `Quit`.
    pub fn run_next_tasks(&mut self) -> Result<Event> {
        loop {
            if self.step()? == Event::Quit {
                return Ok(Event::Quit);
            }
        }
    }

    /// One frame callback: steps the scheduler and presents a flip when asked.
    pub fn update<D: FrameDriver + ?Sized>(&mut self, driver: &mut D) -> Result<Status> {
        let event = self.step()?;
        if event.requests_flip() {
            driver.flip()?;
        }
        Ok(self.status)
    }

    /// Drives the scheduler from the frame driver until it stops.
    pub fn start<D: FrameDriver + ?Sized>(&mut self, driver: &mut D) -> Result<()> {
        info!("{}: started with {} task(s)", self.name, self.tasks.len());
        self.status = Status::Running;
        let mut frames = 0usize;
        loop {
            driver.wait_for_frame();
            frames += 1;
            if self.update(driver)? == Status::Stopped {
                break;
            }
        }
        info!("{}: stopped after {frames} frame(s)", self.name);
        Ok(())
    }

    /// Walks the chain of entered children down `depth` levels.
    fn frame_mut(&mut self, depth: usize) -> Result<&mut Scheduler> {
        let mut frame = self;
        for level in 0..depth {
            frame = frame
                .child_mut()
                .ok_or_else(|| anyhow!("no active child scheduler at depth {}", level + 1))?;
        }
        Ok(frame)
    }

    fn child_mut(&mut self) -> Option<&mut Scheduler> {
        if !self.entered {
            return None;
        }
        match self.tasks.get_mut(self.cursor)? {
            Task::Step(_) => None,
            Task::Nested(child) => Some(child),
            Task::Conditional(conditional) => conditional.branch_mut(),
        }
    }

    /// `root_stopped` is the stop flag of the scheduler being stepped, which
    /// cancels every frame below it too.
    fn visit(&mut self, root_stopped: bool) -> Result<Visit> {
        self.status = Status::Running;
        if !self.entered {
            if root_stopped {
                debug!("{}: stopping before task {}", self.name, self.cursor);
                self.status = Status::Stopped;
                return Ok(Visit::Stopped);
            }
            if self.stop.is_requested() {
                debug!("{}: stopping before task {}", self.name, self.cursor);
                self.status = Status::Stopped;
                return Ok(Visit::Quit);
            }
            if self.cursor >= self.tasks.len() {
                self.status = Status::Stopped;
                return Ok(Visit::Quit);
            }
        }

        let resuming = std::mem::replace(&mut self.entered, true);
        match &mut self.tasks[self.cursor] {
            Task::Step(step) => match step() {
                Ok(event) => Ok(Visit::Ran(event)),
                Err(err) => {
                    self.entered = false;
                    self.status = Status::Stopped;
                    Err(err)
                }
            },
            Task::Nested(_) => Ok(Visit::Descend),
            Task::Conditional(conditional) => {
                if !resuming {
                    let taken = (conditional.condition)();
                    debug!("{}: conditional took the {} branch", self.name, if taken { "then" } else { "else" });
                    conditional.taken = Some(taken);
                }
                Ok(Visit::Descend)
            }
        }
    }

    fn complete_task(&mut self, event: Event) {
        match event {
            Event::FlipRepeat => {}
            Event::Next | Event::FlipNext => {
                self.entered = false;
                self.cursor += 1;
            }
            Event::Quit => {
                self.entered = false;
                self.cursor += 1;
                self.status = Status::Stopped;
            }
        }
    }

    /// The frame at `depth` has quit. Returns the depth to resume from, or
    /// `None` when the quit reached the root.
    fn unwind(&mut self, mut depth: usize) -> Result<Option<usize>> {
        let ended = self.session.has_ended();
        while depth > 0 {
            depth -= 1;
            let parent = self.frame_mut(depth)?;
            if ended {
                parent.complete_task(Event::Quit);
            } else {
                parent.complete_task(Event::Next);
                return Ok(Some(depth));
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("cursor", &self.cursor)
            .field("tasks", &self.tasks)
            .finish()
    }
}
