//! Reference-counted request storage shared by the three batch types.

use crate::DecodeError;
use prost::Message;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct Payload<R> {
    request: Arc<R>,
    shared: bool,
}

impl<R> Payload<R>
where
    R: Message + Clone + Default + PartialEq,
{
    pub(crate) fn new(request: R) -> Self {
        Self {
            request: Arc::new(request),
            shared: false,
        }
    }

    pub(crate) fn get(&self) -> &R {
        &self.request
    }

    /// Clones the request first when another handle still refers to it.
    pub(crate) fn get_mut(&mut self) -> &mut R {
        let request = Arc::make_mut(&mut self.request);
        self.shared = false;
        request
    }

    pub(crate) fn into_inner(self) -> R {
        Arc::try_unwrap(self.request).unwrap_or_else(|shared| (*shared).clone())
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.shared
    }

    pub(crate) fn share(&mut self) -> Self {
        self.shared = true;
        Self {
            request: Arc::clone(&self.request),
            shared: true,
        }
    }

    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.request, &other.request)
    }

    pub(crate) fn deep_copy(&self) -> Self {
        Self::new(R::clone(&self.request))
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        self.request.encode_to_vec()
    }

    pub(crate) fn decode(signal: &'static str, bytes: &[u8]) -> Result<Self, DecodeError> {
        R::decode(bytes)
            .map(Self::new)
            .map_err(|e| DecodeError::new(signal, e))
    }
}

impl<R: PartialEq> PartialEq for Payload<R> {
    fn eq(&self, other: &Self) -> bool {
        self.request == other.request
    }
}
