use crate::api::ChatApiProvider;
use crate::config::BackendConfig;
use crate::models::{Conversation, Message, Role};
use crate::storage::ConversationStore;
use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;

// Shown in place of the reply when the stream fails. A failed turn is
// terminal; the user resubmits manually.
pub const STREAM_ERROR_TEXT: &str = "An error occurred. Please try again.";

const TITLE_MAX_CHARS: usize = 40;

// Explicit stream phase. Reconciliation is bound to the Streaming -> Idle
// edge, which happens exactly once per turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
}

// Conversation list keyed by id, with insertion order kept separately so
// selection and overwrite never scan. Insertion order = creation order;
// display reverses it.
#[derive(Default)]
pub struct ConversationList {
    by_id: HashMap<String, Conversation>,
    order: Vec<String>,
}

impl ConversationList {
    pub fn from_vec(conversations: Vec<Conversation>) -> Self {
        let mut list = Self::default();
        for conversation in conversations {
            list.insert(conversation);
        }
        list
    }

    pub fn insert(&mut self, conversation: Conversation) {
        let id = conversation.id.clone();
        if self.by_id.insert(id.clone(), conversation).is_none() {
            self.order.push(id);
        }
    }

    /// Replaces a conversation's message sequence wholesale. Returns false
    /// if no conversation has this id.
    pub fn replace_messages(&mut self, id: &str, messages: Vec<Message>) -> bool {
        match self.by_id.get_mut(id) {
            Some(conversation) => {
                conversation.messages = messages;
                conversation.last_updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Conversations in insertion (creation) order.
    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.order.iter().filter_map(move |id| self.by_id.get(id))
    }

    /// Snapshot of the list in insertion order, as stored.
    pub fn to_vec(&self) -> Vec<Conversation> {
        self.iter().cloned().collect()
    }
}

// Active session state: the message sequence on screen, the conversation it
// belongs to (if any), and the stream phase gating submission.
pub struct ChatSession {
    messages: Vec<Message>,
    current_conversation_id: Option<String>,
    phase: StreamPhase,
    conversations: ConversationList,
    // Last minted conversation id, for same-millisecond tiebreaking.
    last_minted_ms: i64,
}

impl ChatSession {
    pub fn new(stored: Vec<Conversation>) -> Self {
        Self {
            messages: Vec::new(),
            current_conversation_id: None,
            phase: StreamPhase::Idle,
            conversations: ConversationList::from_vec(stored),
            last_minted_ms: 0,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn conversations(&self) -> &ConversationList {
        &self.conversations
    }

    pub fn current_conversation_id(&self) -> Option<&str> {
        self.current_conversation_id.as_deref()
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == StreamPhase::Streaming
    }

    /// Clears the active session. Does not touch the store.
    pub fn new_chat(&mut self) {
        self.messages.clear();
        self.current_conversation_id = None;
    }

    /// Replaces the active session with a stored conversation, by value, so
    /// later edits cannot reach the stored entry before the next
    /// reconciliation. Unknown ids are a no-op; returns whether one matched.
    pub fn select_conversation(&mut self, id: &str) -> bool {
        match self.conversations.get(id) {
            Some(conversation) => {
                self.messages = conversation.messages.clone();
                self.current_conversation_id = Some(conversation.id.clone());
                true
            }
            None => false,
        }
    }

    /// Gate and setup for one turn: appends the user message plus an empty
    /// placeholder model message and enters Streaming. Blank input, or a
    /// turn already outstanding, is a no-op (returns false, list untouched).
    pub fn begin_turn(&mut self, prompt: &str) -> bool {
        if prompt.trim().is_empty() || self.phase == StreamPhase::Streaming {
            return false;
        }
        self.messages.push(Message::user(prompt));
        self.messages.push(Message::model_placeholder());
        self.phase = StreamPhase::Streaming;
        true
    }

    /// Appends one received fragment to the placeholder, in arrival order.
    pub fn append_fragment(&mut self, fragment: &str) {
        if let Some(last) = self.messages.last_mut() {
            if last.role == Role::Model {
                last.content.push_str(fragment);
            }
        }
    }

    /// Replaces the placeholder's content with the fixed error text.
    pub fn fail_turn(&mut self) {
        if let Some(last) = self.messages.last_mut() {
            if last.role == Role::Model {
                last.content = STREAM_ERROR_TEXT.to_string();
            }
        }
    }

    /// The Streaming -> Idle edge: reconciles the active session into the
    /// conversation list and persists the whole list. Runs at most once per
    /// turn, and only if any messages exist. Failed turns reconcile too.
    pub async fn finish_turn(&mut self, store: &ConversationStore) -> Result<()> {
        if self.phase != StreamPhase::Streaming {
            return Ok(());
        }
        self.phase = StreamPhase::Idle;

        if self.messages.is_empty() {
            return Ok(());
        }

        self.reconcile();
        store.save(&self.conversations.to_vec()).await
    }

    /// One whole turn: gate, open the stream, append fragments as they
    /// arrive (invoking `on_fragment` after each append), then reconcile
    /// and persist. Returns false if the submission was gated out. The
    /// phase returns to Idle on every exit path; stream failure is
    /// non-fatal and leaves the fixed error text in place.
    pub async fn submit<F>(
        &mut self,
        provider: &dyn ChatApiProvider,
        config: &BackendConfig,
        api_key: &str,
        store: &ConversationStore,
        prompt: &str,
        mut on_fragment: F,
    ) -> Result<bool>
    where
        F: FnMut(&str),
    {
        if !self.begin_turn(prompt) {
            log::debug!("Submission ignored: blank prompt or a stream is outstanding");
            return Ok(false);
        }

        match provider.stream_response(config, api_key, prompt).await {
            Ok(mut fragments) => {
                while let Some(next) = fragments.next().await {
                    match next {
                        Ok(fragment) => {
                            self.append_fragment(&fragment);
                            on_fragment(&fragment);
                        }
                        Err(e) => {
                            log::error!("Stream failed mid-turn: {:?}", e);
                            self.fail_turn();
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to open response stream: {:?}", e);
                self.fail_turn();
            }
        }

        self.finish_turn(store).await?;
        Ok(true)
    }

    // Folds the active session into the conversation list: a bound id gets
    // its messages overwritten; otherwise a new conversation is created and
    // the session binds to it.
    fn reconcile(&mut self) {
        let bound = self
            .current_conversation_id
            .clone()
            .map(|id| self.conversations.replace_messages(&id, self.messages.clone()))
            .unwrap_or(false);

        if !bound {
            let id = self.mint_conversation_id();
            let title = derive_title(&self.messages[0].content);
            log::info!("Creating conversation {} ({})", id, title);
            self.conversations.insert(Conversation {
                id: id.clone(),
                title,
                messages: self.messages.clone(),
                created_at: Utc::now(),
                last_updated_at: Utc::now(),
            });
            self.current_conversation_id = Some(id);
        }
    }

    // Timestamp-derived id, bumped past the previous one when two land in
    // the same millisecond.
    fn mint_conversation_id(&mut self) -> String {
        let mut ms = Utc::now().timestamp_millis();
        if ms <= self.last_minted_ms {
            ms = self.last_minted_ms + 1;
        }
        self.last_minted_ms = ms;
        ms.to_string()
    }
}

// First message, clipped to 40 characters with an ellipsis marker when it
// was longer; verbatim otherwise.
fn derive_title(content: &str) -> String {
    let mut title: String = content.chars().take(TITLE_MAX_CHARS).collect();
    if content.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FragmentStream;
    use anyhow::anyhow;
    use async_trait::async_trait;

    // Provider that plays back a fixed script of fragments.
    struct ScriptedProvider {
        fragments: Vec<&'static str>,
    }

    #[async_trait]
    impl ChatApiProvider for ScriptedProvider {
        async fn stream_response(
            &self,
            _config: &BackendConfig,
            _api_key: &str,
            _prompt: &str,
        ) -> Result<FragmentStream> {
            let items: Vec<Result<String>> =
                self.fragments.iter().map(|f| Ok((*f).to_string())).collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    // Provider whose channel never opens.
    struct RefusingProvider;

    #[async_trait]
    impl ChatApiProvider for RefusingProvider {
        async fn stream_response(
            &self,
            _config: &BackendConfig,
            _api_key: &str,
            _prompt: &str,
        ) -> Result<FragmentStream> {
            Err(anyhow!("connection refused"))
        }
    }

    // Provider that yields one fragment and then dies.
    struct MidStreamFailProvider;

    #[async_trait]
    impl ChatApiProvider for MidStreamFailProvider {
        async fn stream_response(
            &self,
            _config: &BackendConfig,
            _api_key: &str,
            _prompt: &str,
        ) -> Result<FragmentStream> {
            let items: Vec<Result<String>> =
                vec![Ok("partial".to_string()), Err(anyhow!("channel dropped"))];
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    fn test_config() -> BackendConfig {
        BackendConfig {
            name: "test".to_string(),
            api_url: "http://localhost:0".to_string(),
            model: "test-model".to_string(),
            api_key_ref: None,
        }
    }

    async fn temp_store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConversationStore::open(&dir.path().join("session.sqlite"))
            .await
            .expect("open store");
        (dir, store)
    }

    async fn run_turn(
        session: &mut ChatSession,
        provider: &dyn ChatApiProvider,
        store: &ConversationStore,
        prompt: &str,
    ) -> bool {
        session
            .submit(provider, &test_config(), "key", store, prompt, |_| {})
            .await
            .expect("turn should not fail")
    }

    #[tokio::test]
    async fn fragments_accumulate_in_arrival_order() {
        let (_dir, store) = temp_store().await;
        let provider = ScriptedProvider {
            fragments: vec!["Hel", "lo ", "wor", "ld"],
        };
        let mut session = ChatSession::new(Vec::new());

        let mut seen = String::new();
        let ran = session
            .submit(&provider, &test_config(), "key", &store, "hi", |f| {
                seen.push_str(f)
            })
            .await
            .unwrap();

        assert!(ran);
        assert_eq!(seen, "Hello world");
        let last = session.messages().last().unwrap();
        assert_eq!(last.role, Role::Model);
        assert_eq!(last.content, "Hello world");
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn submitting_while_busy_is_a_noop() {
        let (_dir, store) = temp_store().await;
        let provider = ScriptedProvider { fragments: vec!["x"] };
        let mut session = ChatSession::new(Vec::new());

        assert!(session.begin_turn("first"));
        let len_before = session.messages().len();

        let ran = run_turn(&mut session, &provider, &store, "second").await;
        assert!(!ran);
        assert_eq!(session.messages().len(), len_before);
    }

    #[tokio::test]
    async fn blank_input_is_a_noop() {
        let (_dir, store) = temp_store().await;
        let provider = ScriptedProvider { fragments: vec!["x"] };
        let mut session = ChatSession::new(Vec::new());

        let ran = run_turn(&mut session, &provider, &store, "   ").await;
        assert!(!ran);
        assert!(session.messages().is_empty());
        assert!(session.conversations().is_empty());
    }

    #[tokio::test]
    async fn first_turn_creates_one_conversation_and_binds_it() {
        let (_dir, store) = temp_store().await;
        let provider = ScriptedProvider { fragments: vec!["reply"] };
        let mut session = ChatSession::new(Vec::new());

        run_turn(&mut session, &provider, &store, "short prompt").await;

        assert_eq!(session.conversations().len(), 1);
        let convo = session.conversations().iter().next().unwrap();
        assert_eq!(convo.title, "short prompt"); // verbatim, under the limit
        assert_eq!(session.current_conversation_id(), Some(convo.id.as_str()));

        // In-memory list and persisted copy match after the exchange.
        let stored = store.load().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, convo.id);
        assert_eq!(stored[0].title, convo.title);
        assert_eq!(stored[0].messages.len(), 2);
        assert_eq!(stored[0].messages[1].content, "reply");
    }

    #[tokio::test]
    async fn long_first_message_gets_a_truncated_title() {
        let (_dir, store) = temp_store().await;
        let provider = ScriptedProvider { fragments: vec!["ok"] };
        let mut session = ChatSession::new(Vec::new());

        let prompt = "a".repeat(50);
        run_turn(&mut session, &provider, &store, &prompt).await;

        let convo = session.conversations().iter().next().unwrap();
        assert_eq!(convo.title, format!("{}...", "a".repeat(40)));
    }

    #[tokio::test]
    async fn bound_turn_overwrites_without_adding_conversations() {
        let (_dir, store) = temp_store().await;
        let provider = ScriptedProvider { fragments: vec!["reply"] };
        let mut session = ChatSession::new(Vec::new());

        run_turn(&mut session, &provider, &store, "first question").await;
        let id = session.current_conversation_id().unwrap().to_string();

        run_turn(&mut session, &provider, &store, "follow up").await;

        assert_eq!(session.conversations().len(), 1);
        let convo = session.conversations().get(&id).unwrap();
        assert_eq!(convo.messages.len(), 4);
        assert_eq!(convo.title, "first question"); // never recomputed

        let stored = store.load().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].messages.len(), 4);
    }

    #[tokio::test]
    async fn new_chat_after_a_turn_creates_a_second_conversation() {
        let (_dir, store) = temp_store().await;
        let provider = ScriptedProvider { fragments: vec!["reply"] };
        let mut session = ChatSession::new(Vec::new());

        run_turn(&mut session, &provider, &store, "topic one").await;
        let first_id = session.current_conversation_id().unwrap().to_string();

        session.new_chat();
        assert!(session.messages().is_empty());
        assert_eq!(session.current_conversation_id(), None);

        run_turn(&mut session, &provider, &store, "topic two").await;
        let second_id = session.current_conversation_id().unwrap().to_string();

        assert_eq!(session.conversations().len(), 2);
        assert_ne!(first_id, second_id);
        // Ids stay monotonically distinguishable even within a millisecond.
        assert!(second_id.parse::<i64>().unwrap() > first_id.parse::<i64>().unwrap());
    }

    #[tokio::test]
    async fn selecting_an_unknown_id_changes_nothing() {
        let (_dir, store) = temp_store().await;
        let provider = ScriptedProvider { fragments: vec!["reply"] };
        let mut session = ChatSession::new(Vec::new());

        run_turn(&mut session, &provider, &store, "hello").await;
        let bound = session.current_conversation_id().map(String::from);
        let len = session.messages().len();

        assert!(!session.select_conversation("no-such-id"));
        assert_eq!(session.messages().len(), len);
        assert_eq!(session.current_conversation_id().map(String::from), bound);
    }

    #[tokio::test]
    async fn selection_copies_by_value() {
        let (_dir, store) = temp_store().await;
        let provider = ScriptedProvider { fragments: vec!["reply"] };
        let mut session = ChatSession::new(Vec::new());

        run_turn(&mut session, &provider, &store, "hello").await;
        let id = session.current_conversation_id().unwrap().to_string();

        session.new_chat();
        assert!(session.select_conversation(&id));

        // Mutating the active copy must not reach the stored entry until
        // the next reconciliation.
        session.begin_turn("unsaved edit");
        assert_eq!(session.conversations().get(&id).unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn refused_stream_leaves_the_error_text_and_goes_idle() {
        let (_dir, store) = temp_store().await;
        let mut session = ChatSession::new(Vec::new());

        let ran = run_turn(&mut session, &RefusingProvider, &store, "hello").await;
        assert!(ran);
        assert_eq!(session.messages().last().unwrap().content, STREAM_ERROR_TEXT);
        assert!(!session.is_streaming());
        // The failed turn is still reconciled and persisted.
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mid_stream_failure_replaces_partial_content() {
        let (_dir, store) = temp_store().await;
        let mut session = ChatSession::new(Vec::new());

        run_turn(&mut session, &MidStreamFailProvider, &store, "hello").await;
        assert_eq!(session.messages().last().unwrap().content, STREAM_ERROR_TEXT);
        assert!(!session.is_streaming());
    }

    #[test]
    fn titles_clip_at_forty_characters() {
        assert_eq!(derive_title("short"), "short");
        let exact = "b".repeat(40);
        assert_eq!(derive_title(&exact), exact);
        assert_eq!(derive_title(&"c".repeat(41)), format!("{}...", "c".repeat(40)));
    }

    #[test]
    fn stored_order_is_preserved_by_the_list() {
        let list = ConversationList::from_vec(vec![
            Conversation {
                id: "10".to_string(),
                title: "older".to_string(),
                messages: Vec::new(),
                created_at: Utc::now(),
                last_updated_at: Utc::now(),
            },
            Conversation {
                id: "20".to_string(),
                title: "newer".to_string(),
                messages: Vec::new(),
                created_at: Utc::now(),
                last_updated_at: Utc::now(),
            },
        ]);
        let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["10", "20"]);
    }
}
