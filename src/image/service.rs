use std::sync::{Arc, Mutex};

use log::info;

use crate::{
    events::{Subscribers, Subscription},
    utils::lock,
};

use super::{
    error::ImageError,
    stack::{ImageStack, ImageStackId, ImageStackSummary},
};

/// The list of open image stacks.
///
/// Every mutation publishes the complete list to `on_images_changed` subscribers.
/// Publication happens under a separate lock so listeners see snapshots in order.
#[derive(Default)]
pub struct ImageService {
    image_stacks: Mutex<Vec<Arc<ImageStack>>>,
    subscribers: Arc<Subscribers<Vec<ImageStackSummary>>>,
    notify_lock: Mutex<()>,
}

impl ImageService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stack(&self, stack: ImageStack) -> Arc<ImageStack> {
        let stack = Arc::new(stack);
        self.mutate(|stacks| {
            stacks.push(stack.clone());
            Some(())
        });
        info!("Added image stack {}", stack.id());
        stack
    }

    pub fn remove_stack(&self, id: ImageStackId) -> Result<Arc<ImageStack>, ImageError> {
        let removed = self.mutate(|stacks| {
            let idx = stacks.iter().position(|s| s.id() == id)?;
            Some(stacks.remove(idx))
        });
        let removed = removed.ok_or(ImageError::StackNotFound(id))?;
        info!("Removed image stack {id}");
        Ok(removed)
    }

    pub fn get_stack(&self, id: ImageStackId) -> Result<Arc<ImageStack>, ImageError> {
        lock(&self.image_stacks)
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or(ImageError::StackNotFound(id))
    }

    pub fn list(&self) -> Vec<ImageStackSummary> {
        lock(&self.image_stacks).iter().map(|s| s.summary()).collect()
    }

    /// Replaces the whole list with an authoritative snapshot.
    pub fn replace_all(&self, stacks: Vec<ImageStack>) {
        let stacks: Vec<_> = stacks.into_iter().map(Arc::new).collect();
        self.mutate(move |current| {
            *current = stacks;
            Some(())
        });
    }

    pub fn on_images_changed<F>(&self, callback: F) -> Subscription<Vec<ImageStackSummary>>
    where
        F: Fn(&Vec<ImageStackSummary>) + Send + Sync + 'static,
    {
        let id = self.subscribers.subscribe(callback);
        Subscription::new(id, &self.subscribers)
    }

    /// Runs `f` and publishes the new list, unless `f` returned `None`.
    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Arc<ImageStack>>) -> Option<R>) -> Option<R> {
        let _ordered = lock(&self.notify_lock);
        let (result, snapshot) = {
            let mut stacks = lock(&self.image_stacks);
            let result = f(&mut stacks)?;
            (result, stacks.iter().map(|s| s.summary()).collect::<Vec<_>>())
        };
        self.subscribers.notify(&snapshot);
        Some(result)
    }
}
