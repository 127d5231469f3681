//! The inline tool-call loop, end to end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use socratic_council::council::event::{event_kind, RecordingHandler};
use socratic_council::council::oracle::{OracleError, OracleTool};
use socratic_council::council::transport::{
    Transport, TransportError, TransportRequest, UnaryResponse,
};
use socratic_council::{Council, CouncilConfig, CredentialStore, ProviderKind, Source};
use tokio_util::sync::CancellationToken;

fn chat_sse(text: &str) -> String {
    format!(
        concat!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{text}}},\"finish_reason\":\"stop\"}}]}}\n\n",
            "data: {{\"choices\":[],\"usage\":{{\"prompt_tokens\":20,\"completion_tokens\":10}}}}\n\n",
            "data: [DONE]\n\n",
        ),
        text = serde_json::to_string(text).unwrap(),
    )
}

struct ScriptedTransport {
    bodies: std::sync::Mutex<VecDeque<String>>,
    fallback: String,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, _req: &TransportRequest) -> Result<UnaryResponse, TransportError> {
        Ok(UnaryResponse {
            status: 200,
            headers: Default::default(),
            body: self.next(),
        })
    }

    async fn fetch_stream(
        &self,
        _req: &TransportRequest,
        on_chunk: &mut (dyn for<'r> FnMut(&'r str) + Send),
        _cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        on_chunk(&self.next());
        Ok(())
    }
}

impl ScriptedTransport {
    fn new(bodies: Vec<String>, fallback: String) -> Self {
        Self {
            bodies: std::sync::Mutex::new(bodies.into()),
            fallback,
        }
    }

    fn next(&self) -> String {
        self.bodies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct CountingOracle {
    calls: AtomicUsize,
}

#[async_trait]
impl OracleTool for CountingOracle {
    async fn search(&self, query: &str) -> Result<String, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("two sources discuss {query}"))
    }

    async fn verify(&self, claim: &str) -> Result<String, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("claim checks out: {claim}"))
    }

    async fn cite(&self, topic: &str) -> Result<String, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("citation for {topic}"))
    }
}

fn single_agent_credentials() -> CredentialStore {
    let mut credentials = CredentialStore::default();
    credentials.set_api_key(ProviderKind::DeepSeek, "sk-test");
    credentials
}

#[tokio::test]
async fn tool_loop_terminates_after_two_iterations() {
    socratic_council::init_logger();
    // Every completion asks for another search; the loop must still stop
    // after two dispatch rounds and strip the leftover directive.
    let greedy = |n: usize| {
        chat_sse(&format!(
            "Round {n}. @tool(oracle.search, {{\"query\": \"q{n}\"}}) continuing."
        ))
    };
    let transport = Arc::new(ScriptedTransport::new(
        vec![greedy(1), greedy(2), greedy(3)],
        greedy(9),
    ));
    let oracle = Arc::new(CountingOracle {
        calls: AtomicUsize::new(0),
    });

    let council = Arc::new(
        Council::new(
            CouncilConfig::default()
                .with_max_turns(1)
                .with_turn_pacing_ms(0),
            single_agent_credentials(),
        )
        .with_transport(transport)
        .with_oracle(oracle.clone()),
    );
    let handler = Arc::new(RecordingHandler::new());
    council.set_event_handler(handler.clone()).await;

    council.start("Tool loop bounds", None).await.unwrap();
    council.run().await.unwrap();

    // Two dispatch rounds, one directive each.
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);

    let state = council.snapshot().await;
    assert_eq!(state.turn, 1);
    let tool_messages: Vec<_> = state
        .messages
        .iter()
        .filter(|m| m.source == Source::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 2);
    assert!(tool_messages[0]
        .content
        .starts_with("Tool result (oracle.search):"));

    let final_reply = state
        .messages
        .iter()
        .rev()
        .find(|m| m.source.agent().is_some())
        .unwrap();
    assert!(!final_reply.content.contains("@tool"));
    assert!(final_reply.content.contains("Round 1."));
    assert!(final_reply.content.contains("Round 3."));
}

#[tokio::test]
async fn tool_results_precede_the_agent_completion() {
    socratic_council::init_logger();
    let body = chat_sse(
        "Checking. @tool(oracle.verify, {\"claim\": \"the sky is blue\"}) Done checking.",
    );
    let plain = chat_sse("All verified, final answer.");
    let transport = Arc::new(ScriptedTransport::new(vec![body], plain));
    let oracle = Arc::new(CountingOracle {
        calls: AtomicUsize::new(0),
    });

    let council = Arc::new(
        Council::new(
            CouncilConfig::default()
                .with_max_turns(1)
                .with_turn_pacing_ms(0),
            single_agent_credentials(),
        )
        .with_transport(transport)
        .with_oracle(oracle.clone()),
    );
    let handler = Arc::new(RecordingHandler::new());
    council.set_event_handler(handler.clone()).await;

    council.start("Ordering", None).await.unwrap();
    council.run().await.unwrap();

    let events = handler.events().await;
    let kinds: Vec<_> = events.iter().map(event_kind).collect();

    let replace_at = kinds.iter().position(|k| *k == "message_replace").unwrap();
    let oracle_at = kinds.iter().position(|k| *k == "oracle_result").unwrap();
    let completions: Vec<usize> = kinds
        .iter()
        .enumerate()
        .filter(|(_, k)| **k == "message_complete")
        .map(|(i, _)| i)
        .collect();
    // [0] topic system message, [1] tool result, [2] agent reply.
    assert_eq!(completions.len(), 3);
    assert!(replace_at < completions[1]);
    assert!(completions[1] < oracle_at);
    assert!(oracle_at < completions[2]);

    assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn malformed_directives_never_reach_the_oracle() {
    socratic_council::init_logger();
    let body = chat_sse("Opinion. @tool(oracle.search, {broken json}) more opinion.");
    let transport = Arc::new(ScriptedTransport::new(vec![body.clone()], body));
    let oracle = Arc::new(CountingOracle {
        calls: AtomicUsize::new(0),
    });

    let council = Arc::new(
        Council::new(
            CouncilConfig::default()
                .with_max_turns(1)
                .with_turn_pacing_ms(0),
            single_agent_credentials(),
        )
        .with_transport(transport)
        .with_oracle(oracle.clone()),
    );
    council.start("Malformed args", None).await.unwrap();
    council.run().await.unwrap();

    assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    let state = council.snapshot().await;
    let reply = state
        .messages
        .iter()
        .rev()
        .find(|m| m.source.agent().is_some())
        .unwrap();
    assert!(!reply.content.contains("@tool"));
    assert!(reply.content.contains("Opinion."));
    assert!(reply.content.contains("more opinion."));
}

#[tokio::test]
async fn query_oracle_lands_in_transcript() {
    socratic_council::init_logger();
    let transport = Arc::new(ScriptedTransport::new(Vec::new(), chat_sse("x")));
    let oracle = Arc::new(CountingOracle {
        calls: AtomicUsize::new(0),
    });
    let council = Arc::new(
        Council::new(CouncilConfig::default(), single_agent_credentials())
            .with_transport(transport)
            .with_oracle(oracle),
    );
    let handler = Arc::new(RecordingHandler::new());
    council.set_event_handler(handler.clone()).await;

    council.start("Direct oracle", None).await.unwrap();
    council.query_oracle("population of Lisbon").await;

    let state = council.snapshot().await;
    let tool_message = state
        .messages
        .iter()
        .find(|m| m.source == Source::Tool)
        .unwrap();
    assert!(tool_message
        .content
        .contains("two sources discuss population of Lisbon"));
    assert!(handler.kinds().await.contains(&"oracle_result"));
}
