use std::{ops::Deref, sync::Arc};

use crate::{config::Config, dispatcher::Dispatcher, storage::kv::KvStore};

pub struct InnerWebContext {
    pub(crate) config: Config,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) kv: Arc<dyn KvStore>,
}

#[derive(Clone)]
pub struct WebContext(pub(crate) Arc<InnerWebContext>);

impl Deref for WebContext {
    type Target = InnerWebContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl WebContext {
    pub fn new(config: Config, dispatcher: Arc<Dispatcher>, kv: Arc<dyn KvStore>) -> Self {
        Self(Arc::new(InnerWebContext {
            config,
            dispatcher,
            kv,
        }))
    }
}
