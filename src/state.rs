use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Typed application state shared read-only with every request.
///
/// Values are registered while the application is being built; once the
/// application starts serving, each request holds a cheap clone. Inserting
/// into a clone copies the map, leaving the other clones untouched.
#[derive(Default, Debug, Clone)]
pub struct AppState {
    data: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            data: Arc::new(HashMap::new()),
        }
    }

    pub(crate) fn insert<T: 'static + Send + Sync>(&mut self, value: T) {
        Arc::make_mut(&mut self.data).insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.data
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mailer {
        from: &'static str,
    }

    #[test]
    fn test_get_by_type() {
        let mut state = AppState::new();
        state.insert(Mailer { from: "noreply@example.com" });
        state.insert(42u32);

        let shared = state.clone();
        assert_eq!(shared.get::<Mailer>().map(|m| m.from), Some("noreply@example.com"));
        assert_eq!(shared.get::<u32>(), Some(&42));
        assert!(shared.get::<String>().is_none());
    }

    #[test]
    fn test_insert_after_clone_is_copy_on_write() {
        let mut state = AppState::new();
        state.insert(1u8);
        let serving = state.clone();

        state.insert(2u8);
        state.insert("late");
        assert_eq!(state.get::<u8>(), Some(&2));
        assert_eq!(serving.get::<u8>(), Some(&1));
        assert!(serving.get::<&str>().is_none());
    }
}
