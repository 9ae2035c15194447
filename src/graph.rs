//! One pass of the agent graph:
//!
//! ```text
//! memory -> (research | skip) -> script -> director -> (director | critic)
//!        -> (human approval | end)
//! ```
//!
//! Routing is done by pure functions over the merged state. The only cycle is
//! the Director self-retry, bounded by `director_retries`; the executor also
//! carries a node-visit guard so a routing bug surfaces as an error instead of
//! a hang.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::agents::{Agent, is_meaningful};
use crate::error::PassError;
use crate::events::{Emitter, HUMAN_APPROVAL_REQUESTED};
use crate::state::{HumanApproval, LoopState, StateUpdate};

/// Scores strictly inside this band are routed to a human.
pub const BORDERLINE_LOW: f64 = 0.5;
pub const BORDERLINE_HIGH: f64 = 0.9;

/// Upper bound on node executions in one pass. A well-formed pass visits at
/// most seven nodes.
pub const MAX_NODE_VISITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    Memory,
    Research,
    Script,
    Director,
    Critic,
    HumanApproval,
    End,
}

impl Node {
    pub fn label(self) -> &'static str {
        match self {
            Node::Memory => "memory",
            Node::Research => "research",
            Node::Script => "script",
            Node::Director => "director",
            Node::Critic => "critic",
            Node::HumanApproval => "human_approval",
            Node::End => "end",
        }
    }
}

/// After memory: skip research once a previous pass left both style keywords
/// and recommendations behind.
pub fn should_research(state: &LoopState) -> Node {
    let has_context = is_meaningful(state.memory.get("style_keywords"))
        && is_meaningful(state.memory.get("recommendations"));
    if state.iteration > 1 && has_context {
        Node::Script
    } else {
        Node::Research
    }
}

/// After director: retry exactly once when the first attempt produced
/// nothing.
pub fn after_director(state: &LoopState) -> Node {
    if state.assets.is_empty() && state.director_retries == 1 {
        Node::Director
    } else {
        Node::Critic
    }
}

pub fn is_borderline(score: f64) -> bool {
    score > BORDERLINE_LOW && score < BORDERLINE_HIGH
}

/// After critic: borderline scores go to a human unless approval is already
/// resolved.
pub fn after_critic(state: &LoopState) -> Node {
    if state.human_approval.is_some() {
        return Node::End;
    }
    match &state.critique {
        Some(critique) if is_borderline(critique.score) => Node::HumanApproval,
        _ => Node::End,
    }
}

/// Resolves a borderline critique.
#[async_trait]
pub trait HumanApprover: Send + Sync {
    async fn review(&self, state: &LoopState) -> HumanApproval;
}

/// Approves everything without waiting.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl HumanApprover for AutoApprove {
    async fn review(&self, _state: &LoopState) -> HumanApproval {
        HumanApproval {
            approved: true,
            notes: "auto-approved".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AgentSet {
    pub memory: Arc<dyn Agent>,
    pub research: Arc<dyn Agent>,
    pub script: Arc<dyn Agent>,
    pub director: Arc<dyn Agent>,
    pub critic: Arc<dyn Agent>,
}

#[derive(Clone)]
pub struct PassExecutor {
    agents: AgentSet,
    approver: Arc<dyn HumanApprover>,
    events: Emitter,
}

impl PassExecutor {
    pub fn new(agents: AgentSet) -> Self {
        Self {
            agents,
            approver: Arc::new(AutoApprove),
            events: Emitter::disabled(),
        }
    }

    pub fn with_approver(mut self, approver: Arc<dyn HumanApprover>) -> Self {
        self.approver = approver;
        self
    }

    pub fn with_events(mut self, events: Emitter) -> Self {
        self.events = events;
        self
    }

    /// Run one pass, merging each node's update before routing on it.
    pub async fn run_pass(&self, mut state: LoopState) -> Result<LoopState, PassError> {
        let mut node = Node::Memory;
        let mut visits = 0usize;

        while node != Node::End {
            visits += 1;
            if visits > MAX_NODE_VISITS {
                return Err(PassError::StepLimit { visits });
            }
            tracing::debug!(iteration = state.iteration, node = node.label(), "entering node");

            node = match node {
                Node::Memory => {
                    state.apply(self.agents.memory.run(&state).await);
                    should_research(&state)
                }
                Node::Research => {
                    state.apply(self.agents.research.run(&state).await);
                    Node::Script
                }
                Node::Script => {
                    state.apply(self.agents.script.run(&state).await);
                    Node::Director
                }
                Node::Director => {
                    state.apply(self.agents.director.run(&state).await);
                    after_director(&state)
                }
                Node::Critic => {
                    state.apply(self.agents.critic.run(&state).await);
                    after_critic(&state)
                }
                Node::HumanApproval => {
                    let update = self.request_approval(&state).await;
                    state.apply(update);
                    after_critic(&state)
                }
                Node::End => Node::End,
            };
        }

        Ok(state)
    }

    async fn request_approval(&self, state: &LoopState) -> StateUpdate {
        let score = state.score();
        tracing::info!(iteration = state.iteration, score, "borderline score, requesting human approval");
        self.events.emit(
            HUMAN_APPROVAL_REQUESTED,
            json!({"iteration": state.iteration, "score": score}),
        );

        let approval = self.approver.review(state).await;
        let mut update = StateUpdate::new().with_message(format!(
            "[human] {} ({})",
            if approval.approved { "Approved" } else { "Rejected" },
            approval.notes
        ));

        // A rejection vetoes a passing critique; an approval never promotes.
        if !approval.approved
            && let Some(critique) = state.critique.as_ref().filter(|c| c.pass)
        {
            let mut vetoed = critique.clone();
            vetoed.pass = false;
            update = update.with_critique(vetoed);
        }
        update.with_human_approval(approval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brief::Brief;
    use crate::state::{Asset, Critique, Task};
    use serde_json::{Map, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state(iteration: u32) -> LoopState {
        let mut state = LoopState::new(Brief::new("teaser"));
        state.iteration = iteration;
        state
    }

    fn asset(step: u32) -> Asset {
        Asset {
            kind: "image".into(),
            path: format!("step-{step}.png"),
            step,
            metadata: Map::new(),
            iteration: None,
        }
    }

    fn critique(score: f64, pass: bool) -> Critique {
        Critique {
            score,
            pass,
            feedback: String::new(),
            strengths: Vec::new(),
            improvements: Vec::new(),
            priority_fixes: Vec::new(),
        }
    }

    #[test]
    fn research_is_skipped_only_with_prior_context() {
        let mut s = state(2);
        s.memory.insert("style_keywords".into(), json!(["noir"]));
        s.memory.insert("recommendations".into(), json!(["grain"]));
        assert_eq!(should_research(&s), Node::Script);

        s.iteration = 1;
        assert_eq!(should_research(&s), Node::Research);

        s.iteration = 3;
        s.memory.insert("recommendations".into(), json!([]));
        assert_eq!(should_research(&s), Node::Research);

        s.memory.remove("recommendations");
        assert_eq!(should_research(&s), Node::Research);
    }

    #[test]
    fn director_retries_exactly_once_on_empty_output() {
        let mut s = state(1);
        for retries in [0, 2, 3] {
            s.director_retries = retries;
            assert_eq!(after_director(&s), Node::Critic, "retries={retries}");
        }
        s.director_retries = 1;
        assert_eq!(after_director(&s), Node::Director);

        s.assets = vec![asset(1)];
        for retries in 0..4 {
            s.director_retries = retries;
            assert_eq!(after_director(&s), Node::Critic);
        }
    }

    #[test]
    fn only_unresolved_borderline_scores_need_a_human() {
        let scores = [0.0, 0.3, 0.5, 0.51, 0.7, 0.89, 0.9, 0.95, 1.0];
        for score in scores {
            let mut s = state(1);
            s.critique = Some(critique(score, false));
            let expected = if score > 0.5 && score < 0.9 {
                Node::HumanApproval
            } else {
                Node::End
            };
            assert_eq!(after_critic(&s), expected, "score={score}");

            s.human_approval = Some(HumanApproval {
                approved: true,
                notes: String::new(),
            });
            assert_eq!(after_critic(&s), Node::End, "score={score} resolved");
        }
    }

    /// Agent returning a fixed update and counting its invocations.
    struct Fixed {
        name: &'static str,
        update: StateUpdate,
        calls: AtomicUsize,
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Agent for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _state: &LoopState) -> StateUpdate {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.trace.lock().unwrap().push(self.name);
            self.update.clone()
        }
    }

    /// Director that always comes back empty-handed.
    struct EmptyDirector {
        calls: AtomicUsize,
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Agent for EmptyDirector {
        fn name(&self) -> &'static str {
            "director"
        }

        async fn run(&self, state: &LoopState) -> StateUpdate {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.trace.lock().unwrap().push("director");
            StateUpdate::new()
                .with_assets(Vec::new())
                .with_director_retries(state.director_retries + 1)
        }
    }

    struct Harness {
        executor: PassExecutor,
        director_calls: Arc<EmptyDirector>,
        trace: Arc<Mutex<Vec<&'static str>>>,
    }

    fn fixed(
        name: &'static str,
        update: StateUpdate,
        trace: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<Fixed> {
        Arc::new(Fixed {
            name,
            update,
            calls: AtomicUsize::new(0),
            trace: trace.clone(),
        })
    }

    fn harness(critic_score: f64) -> Harness {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let director = Arc::new(EmptyDirector {
            calls: AtomicUsize::new(0),
            trace: trace.clone(),
        });
        let plan = vec![Task {
            step: 1,
            task: "frame".into(),
            capability: "image_gen".into(),
            params: Map::new(),
        }];
        let agents = AgentSet {
            memory: fixed("memory", StateUpdate::new(), &trace),
            research: fixed("research", StateUpdate::new(), &trace),
            script: fixed("script", StateUpdate::new().with_plan(plan), &trace),
            director: director.clone(),
            critic: fixed(
                "critic",
                StateUpdate::new().with_critique(critique(critic_score, critic_score >= 0.7)),
                &trace,
            ),
        };
        Harness {
            executor: PassExecutor::new(agents),
            director_calls: director,
            trace,
        }
    }

    #[tokio::test]
    async fn empty_director_is_visited_at_most_twice() {
        let h = harness(0.0);

        let result = h.executor.run_pass(state(1)).await.unwrap();

        assert_eq!(h.director_calls.calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.director_retries, 2);
        assert_eq!(
            *h.trace.lock().unwrap(),
            vec!["memory", "research", "script", "director", "director", "critic"]
        );
    }

    struct Rejecting;

    #[async_trait]
    impl HumanApprover for Rejecting {
        async fn review(&self, _state: &LoopState) -> HumanApproval {
            HumanApproval {
                approved: false,
                notes: "off brand".into(),
            }
        }
    }

    #[tokio::test]
    async fn rejection_vetoes_a_borderline_pass() {
        let h = harness(0.8);
        let executor = h.executor.with_approver(Arc::new(Rejecting));

        let result = executor.run_pass(state(1)).await.unwrap();

        assert!(!result.passed());
        assert_eq!(result.score(), 0.8);
        assert_eq!(
            result.human_approval.as_ref().map(|a| a.approved),
            Some(false)
        );
    }

    #[tokio::test]
    async fn approval_does_not_promote_a_failing_score() {
        let h = harness(0.6);

        let result = h.executor.run_pass(state(1)).await.unwrap();

        assert!(!result.passed());
        assert!(result.human_approval.unwrap().approved);
    }

    #[tokio::test]
    async fn confident_scores_skip_the_human() {
        let h = harness(0.95);

        let result = h.executor.run_pass(state(1)).await.unwrap();

        assert!(result.passed());
        assert!(result.human_approval.is_none());
    }

    #[tokio::test]
    async fn approval_request_is_announced() {
        let recorder = Arc::new(crate::events::testing::RecordingSink::default());
        let h = harness(0.75);
        let executor = h.executor.with_events(Emitter::new(recorder.clone()));

        executor.run_pass(state(4)).await.unwrap();

        let requested = recorder.find(HUMAN_APPROVAL_REQUESTED);
        assert_eq!(requested.len(), 1);
        assert_eq!(requested[0]["iteration"], 4);
    }
}
