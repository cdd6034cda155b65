//! Process-wide plugin registry.
//!
//! Seven lazily initialized tables bind string type tags to the registered
//! implementation of each polymorphic family. Tables are mutated only
//! during initialization or explicit registration; afterwards reads take
//! an uncontended lock. Initialization is idempotent and re-entrant: a
//! sentinel stops recursive entry while the built-in bindings install,
//! and any code path that deserializes a polymorphic record ensures
//! initialization first. Protocol crates contribute their bindings through
//! their own `register()` entry points.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::data::auth::{
    ApiKeyAuth, Auth, AuthVariantSerializer, BasicAuth, OAuth2Auth,
};
use crate::data::call_template::CallTemplate;
use crate::data::variable_loader::{
    DotEnvVariableLoader, VariableLoader, VariableLoaderVariantSerializer,
};
use crate::error::{UtcpError, UtcpResult};
use crate::interfaces::communication_protocol::CommunicationProtocol;
use crate::interfaces::post_processor::ToolPostProcessor;
use crate::interfaces::serializer::Serializer;
use crate::interfaces::tool_repository::ToolRepository;
use crate::interfaces::tool_search::ToolSearchStrategy;

type Table<T> = Lazy<RwLock<HashMap<String, Arc<T>>>>;

static AUTH_SERIALIZERS: Table<dyn Serializer<Auth>> = Lazy::new(Default::default);
static VARIABLE_LOADER_SERIALIZERS: Table<dyn Serializer<VariableLoader>> =
    Lazy::new(Default::default);
static CALL_TEMPLATE_SERIALIZERS: Table<dyn Serializer<CallTemplate>> =
    Lazy::new(Default::default);
static COMMUNICATION_PROTOCOLS: Table<dyn CommunicationProtocol> = Lazy::new(Default::default);
static TOOL_REPOSITORY_SERIALIZERS: Table<dyn Serializer<ToolRepository>> =
    Lazy::new(Default::default);
static TOOL_SEARCH_STRATEGY_SERIALIZERS: Table<dyn Serializer<ToolSearchStrategy>> =
    Lazy::new(Default::default);
static TOOL_POST_PROCESSOR_SERIALIZERS: Table<dyn Serializer<ToolPostProcessor>> =
    Lazy::new(Default::default);

fn register<T: ?Sized>(
    table: &RwLock<HashMap<String, Arc<T>>>,
    tag: &str,
    implementation: Arc<T>,
    override_existing: bool,
) -> bool {
    let mut table = table.write();
    if !override_existing && table.contains_key(tag) {
        return false;
    }
    table.insert(tag.to_string(), implementation);
    true
}

fn lookup<T: ?Sized>(
    table: &RwLock<HashMap<String, Arc<T>>>,
    registry: &'static str,
    tag: &str,
) -> UtcpResult<Arc<T>> {
    let table = table.read();
    table.get(tag).cloned().ok_or_else(|| UtcpError::UnknownTag {
        registry,
        tag: tag.to_string(),
        available: {
            let mut tags: Vec<&str> = table.keys().map(String::as_str).collect();
            tags.sort_unstable();
            tags.join(", ")
        },
    })
}

pub fn register_auth(
    auth_type: &str,
    serializer: Arc<dyn Serializer<Auth>>,
    override_existing: bool,
) -> bool {
    register(&AUTH_SERIALIZERS, auth_type, serializer, override_existing)
}

pub fn register_variable_loader(
    loader_type: &str,
    serializer: Arc<dyn Serializer<VariableLoader>>,
    override_existing: bool,
) -> bool {
    register(
        &VARIABLE_LOADER_SERIALIZERS,
        loader_type,
        serializer,
        override_existing,
    )
}

pub fn register_call_template(
    call_template_type: &str,
    serializer: Arc<dyn Serializer<CallTemplate>>,
    override_existing: bool,
) -> bool {
    register(
        &CALL_TEMPLATE_SERIALIZERS,
        call_template_type,
        serializer,
        override_existing,
    )
}

pub fn register_communication_protocol(
    communication_protocol_type: &str,
    protocol: Arc<dyn CommunicationProtocol>,
    override_existing: bool,
) -> bool {
    let accepted = register(
        &COMMUNICATION_PROTOCOLS,
        communication_protocol_type,
        protocol,
        override_existing,
    );
    if accepted {
        debug!(protocol = communication_protocol_type, "registered communication protocol");
    }
    accepted
}

pub fn register_tool_repository(
    tool_repository_type: &str,
    serializer: Arc<dyn Serializer<ToolRepository>>,
    override_existing: bool,
) -> bool {
    register(
        &TOOL_REPOSITORY_SERIALIZERS,
        tool_repository_type,
        serializer,
        override_existing,
    )
}

pub fn register_tool_search_strategy(
    strategy_type: &str,
    serializer: Arc<dyn Serializer<ToolSearchStrategy>>,
    override_existing: bool,
) -> bool {
    register(
        &TOOL_SEARCH_STRATEGY_SERIALIZERS,
        strategy_type,
        serializer,
        override_existing,
    )
}

pub fn register_tool_post_processor(
    post_processor_type: &str,
    serializer: Arc<dyn Serializer<ToolPostProcessor>>,
    override_existing: bool,
) -> bool {
    register(
        &TOOL_POST_PROCESSOR_SERIALIZERS,
        post_processor_type,
        serializer,
        override_existing,
    )
}

pub fn auth_serializer(tag: &str) -> UtcpResult<Arc<dyn Serializer<Auth>>> {
    lookup(&AUTH_SERIALIZERS, "auth", tag)
}

pub fn variable_loader_serializer(tag: &str) -> UtcpResult<Arc<dyn Serializer<VariableLoader>>> {
    lookup(&VARIABLE_LOADER_SERIALIZERS, "variable loader", tag)
}

pub fn call_template_serializer(tag: &str) -> UtcpResult<Arc<dyn Serializer<CallTemplate>>> {
    lookup(&CALL_TEMPLATE_SERIALIZERS, "call template", tag)
}

pub fn communication_protocol(tag: &str) -> UtcpResult<Arc<dyn CommunicationProtocol>> {
    lookup(&COMMUNICATION_PROTOCOLS, "communication protocol", tag)
}

pub fn tool_repository_serializer(tag: &str) -> UtcpResult<Arc<dyn Serializer<ToolRepository>>> {
    lookup(&TOOL_REPOSITORY_SERIALIZERS, "tool repository", tag)
}

pub fn tool_search_strategy_serializer(
    tag: &str,
) -> UtcpResult<Arc<dyn Serializer<ToolSearchStrategy>>> {
    lookup(
        &TOOL_SEARCH_STRATEGY_SERIALIZERS,
        "tool search strategy",
        tag,
    )
}

pub fn tool_post_processor_serializer(
    tag: &str,
) -> UtcpResult<Arc<dyn Serializer<ToolPostProcessor>>> {
    lookup(
        &TOOL_POST_PROCESSOR_SERIALIZERS,
        "tool post processor",
        tag,
    )
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static INIT_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    static LOADING: Cell<bool> = const { Cell::new(false) };
}

/// Install the built-in bindings exactly once. Safe to call from any code
/// path, including re-entrantly while the built-ins are being installed.
pub fn ensure_plugins_initialized() {
    if INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    if LOADING.with(Cell::get) {
        return;
    }
    let _guard = INIT_LOCK.lock();
    if INITIALIZED.load(Ordering::Acquire) {
        return;
    }
    LOADING.with(|loading| loading.set(true));
    install_builtins();
    LOADING.with(|loading| loading.set(false));
    INITIALIZED.store(true, Ordering::Release);
}

fn install_builtins() {
    use crate::implementations::in_mem_tool_repository::InMemToolRepositoryConfigSerializer;
    use crate::implementations::post_processors::filter_dict::FilterDictPostProcessor;
    use crate::implementations::post_processors::limit_strings::LimitStringsPostProcessor;
    use crate::implementations::tag_search::TagAndDescriptionWordMatchStrategyConfigSerializer;
    use crate::interfaces::post_processor::PostProcessorVariantSerializer;
    use crate::interfaces::tool_repository::DEFAULT_REPOSITORY;
    use crate::interfaces::tool_search::DEFAULT_SEARCH_STRATEGY;

    register_auth(
        OAuth2Auth::AUTH_TYPE,
        Arc::new(AuthVariantSerializer::<OAuth2Auth>::new(OAuth2Auth::AUTH_TYPE)),
        false,
    );
    register_auth(
        BasicAuth::AUTH_TYPE,
        Arc::new(AuthVariantSerializer::<BasicAuth>::new(BasicAuth::AUTH_TYPE)),
        false,
    );
    register_auth(
        ApiKeyAuth::AUTH_TYPE,
        Arc::new(AuthVariantSerializer::<ApiKeyAuth>::new(ApiKeyAuth::AUTH_TYPE)),
        false,
    );

    register_variable_loader(
        DotEnvVariableLoader::LOADER_TYPE,
        Arc::new(VariableLoaderVariantSerializer::<DotEnvVariableLoader>::new(
            DotEnvVariableLoader::LOADER_TYPE,
        )),
        false,
    );

    register_tool_repository(
        DEFAULT_REPOSITORY,
        Arc::new(InMemToolRepositoryConfigSerializer),
        false,
    );

    register_tool_search_strategy(
        DEFAULT_SEARCH_STRATEGY,
        Arc::new(TagAndDescriptionWordMatchStrategyConfigSerializer),
        false,
    );

    register_tool_post_processor(
        FilterDictPostProcessor::PROCESSOR_TYPE,
        Arc::new(PostProcessorVariantSerializer::<FilterDictPostProcessor>::new(
            FilterDictPostProcessor::PROCESSOR_TYPE,
        )),
        false,
    );
    register_tool_post_processor(
        LimitStringsPostProcessor::PROCESSOR_TYPE,
        Arc::new(PostProcessorVariantSerializer::<LimitStringsPostProcessor>::new(
            LimitStringsPostProcessor::PROCESSOR_TYPE,
        )),
        false,
    );
}
