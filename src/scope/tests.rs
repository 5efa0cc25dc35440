use std::sync::Arc;

use assert_call::{CallRecorder, call};
use futures::{StreamExt, executor::block_on};
use pretty_assertions::assert_eq;

use super::*;
use crate::{FlushPolicy, Identified, Store, lens};

#[derive(Clone, Debug, PartialEq)]
struct Todo {
    id: u32,
    title: String,
}

impl Identified for Todo {
    type Id = u32;
    fn id(&self) -> u32 {
        self.id
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
struct App {
    count: u32,
    todos: Vec<Todo>,
}

fn todo(id: u32) -> Todo {
    Todo {
        id,
        title: format!("todo {id}"),
    }
}

fn store() -> Store<App> {
    Store::builder(App {
        count: 0,
        todos: vec![todo(1), todo(2)],
    })
    .flush_policy(FlushPolicy::Manual)
    .build()
}

fn count() -> Lens<App, u32> {
    lens!(App, count)
}
fn todos() -> Lens<App, Vec<Todo>> {
    lens!(App, todos)
}
fn title() -> Lens<Todo, String> {
    lens!(Todo, title)
}

#[test]
fn child_lookup_is_memoized() {
    let store = store();
    let a = store.scope().scope(todos());
    let b = store.scope().scope(todos());
    assert_eq!(a.node().unwrap(), b.node().unwrap());
    assert!(Arc::ptr_eq(&a.inner, &b.inner));
    assert_ne!(
        store.scope().scope(count()).node().unwrap(),
        a.node().unwrap()
    );
}

#[test]
fn live_and_override_children_are_distinct() {
    let store = store();
    let live = store.scope().scope(todos());
    let overridden = store.override_scope().scope(todos());
    assert!(!live.is_override());
    assert!(overridden.is_override());
    assert_ne!(live.node().unwrap(), overridden.node().unwrap());
}

#[test]
#[should_panic(expected = "must be a single step")]
fn skipping_an_intermediate_scope_panics() {
    let store = store();
    let _ = store.scope().scope(todos().then(&Lens::element(1)));
}

#[test]
fn scope_at_accepts_composed_lenses() {
    let store = store();
    let title = store
        .scope()
        .scope_at(todos().then(&Lens::element(2)).then(&title()));
    assert_eq!(title.get(), "todo 2");
    assert_eq!(title.path().to_string(), "todos.[2].title");
}

#[test]
fn reads_follow_the_root_snapshot() {
    let store = store();
    let first = store.scope().scope(todos()).scope(Lens::element(1));
    assert_eq!(first.read(&title()), Some("todo 1".to_string()));
    first.scope(title()).set("done".into()).unwrap();
    assert_eq!(first.get().title, "done");
    assert_eq!(store.state().todos[0].title, "done");
}

#[test]
fn write_at_nested_lens() {
    let store = store();
    let root = store.scope();
    root.write_at(&count(), |c| *c += 5).unwrap();
    root.write_at(&todos().then(&Lens::element(2)).then(&title()), |t| {
        t.push('!')
    })
    .unwrap();
    assert_eq!(store.state().count, 5);
    assert_eq!(store.state().todos[1].title, "todo 2!");
}

#[test]
fn writing_a_missing_element_fails() {
    let store = store();
    let todos = store.scope().scope(todos());
    let first = todos.scope(Lens::element(1));
    todos.write(|t| t.retain(|t| t.id != 1)).unwrap();
    assert!(!first.exists());
    assert_eq!(first.try_get(), None);
    assert_eq!(
        first.set(todo(1)),
        Err(Error::Missing(first.path().clone()))
    );
    assert_eq!(
        store.scope().write_at(&self::todos().then(&Lens::element(1)), |_| {}),
        Err(Error::Missing(first.path().clone()))
    );
}

#[test]
#[should_panic(expected = "no value at `todos.[9]`")]
fn get_of_a_missing_value_panics() {
    let store = store();
    store.scope().scope(todos()).scope(Lens::element(9)).get();
}

#[test]
fn read_only_lens_rejects_writes() {
    let store = store();
    let lens = Lens::read_only("count", |a: &App| &a.count);
    let scope = store.scope().scope(lens.clone());
    assert_eq!(scope.get(), 0);
    assert_eq!(scope.set(1), Err(Error::ReadOnlyLens(scope.path().clone())));
    assert!(matches!(
        store.scope().write_at(&lens, |c| *c = 1),
        Err(Error::ReadOnlyLens(_))
    ));
    assert_eq!(store.state().count, 0);
}

#[test]
fn read_only_and_field_lenses_reach_distinct_scopes() {
    let store = store();
    let root = store.scope();
    let field = root.scope(count());
    let read_only = root.scope(Lens::read_only("count", |a: &App| &a.count));
    assert_ne!(field.node().unwrap(), read_only.node().unwrap());
    assert_eq!(read_only.set(1), Err(Error::ReadOnlyLens(read_only.path().clone())));
    field.set(2).unwrap();
    assert_eq!(read_only.get(), 2);
}

#[test]
fn activation_is_counted() {
    let mut cr = CallRecorder::new();
    let store = store();
    let root = store.scope();
    let _a = root.on_activate(|_| call!("activate")).unwrap();
    let _d = root.on_deactivate(|_| call!("deactivate")).unwrap();

    let r1 = root.retain().unwrap();
    let r2 = root.retain().unwrap();
    let r3 = root.retain().unwrap();
    cr.verify("activate");
    assert!(root.is_active());

    drop(r1);
    drop(r2);
    cr.verify(());
    drop(r3);
    cr.verify("deactivate");
    assert!(!root.is_active());

    let _r = root.retain().unwrap();
    cr.verify("activate");
}

#[test]
fn activation_hook_of_an_active_scope_runs_now() {
    let mut cr = CallRecorder::new();
    let store = store();
    let todos = store.scope().scope(todos());
    let _r = todos.retain().unwrap();
    let _a = todos.on_activate(|s| call!("activate {}", s.path())).unwrap();
    cr.verify("activate todos");
}

#[test]
fn hooks_of_a_torn_down_child_run_again_on_reactivation() {
    let mut cr = CallRecorder::new();
    let store = store();
    let todos = store.scope().scope(todos());
    let _a = todos.on_activate(|_| call!("activate")).unwrap();
    let _d = todos.on_deactivate(|_| call!("deactivate")).unwrap();

    let old = todos.node().unwrap();
    drop(todos.retain().unwrap());
    cr.verify(["activate", "deactivate"]);
    assert!(!store.shared().core().contains(old));

    let retain = todos.retain().unwrap();
    cr.verify("activate");
    drop(retain);
    cr.verify("deactivate");

    let _r = store.scope().scope(self::todos()).retain().unwrap();
    cr.verify("activate");
}

#[test]
fn removed_hook_does_not_run_after_teardown() {
    let mut cr = CallRecorder::new();
    let store = store();
    let todos = store.scope().scope(todos());
    let hook = todos.on_activate(|_| call!("activate")).unwrap();
    drop(todos.retain().unwrap());
    cr.verify("activate");

    drop(hook);
    let _r = todos.retain().unwrap();
    cr.verify(());
}

#[test]
fn retained_child_retains_ancestors() {
    let store = store();
    let root = store.scope();
    let todos = root.scope(todos());
    let first = todos.scope(Lens::element(1));
    let retain = first.retain().unwrap();
    assert!(root.is_active());
    assert!(todos.is_active());
    assert!(first.is_active());
    drop(retain);
    assert!(!root.is_active());
    assert!(!todos.is_active());
}

#[test]
fn release_tears_down_deepest_first() {
    let mut cr = CallRecorder::new();
    let store = store();
    let todos = store.scope().scope(todos());
    let first = todos.scope(Lens::element(1));
    let _d0 = todos.on_deactivate(|_| call!("deactivate todos")).unwrap();
    let _d1 = first.on_deactivate(|_| call!("deactivate first")).unwrap();
    let retain = first.retain().unwrap();
    todos
        .register_cancellable(Cancellable::new(|| call!("cancel todos")))
        .unwrap();
    first
        .register_cancellable(Cancellable::new(|| call!("cancel first")))
        .unwrap();
    let old = first.node().unwrap();

    drop(retain);
    cr.verify([
        "cancel first",
        "deactivate first",
        "cancel todos",
        "deactivate todos",
    ]);
    assert!(!store.shared().core().contains(old));
    assert_eq!(store.pending_tasks(), 0);
}

#[test]
fn stale_handle_is_recreated_while_its_state_exists() {
    let store = store();
    let first = store.scope().scope(todos()).scope(Lens::element(1));
    let old = first.node().unwrap();
    drop(first.retain().unwrap());
    let new = first.node().unwrap();
    assert_ne!(old, new);
    assert_eq!(first.get(), todo(1));
}

#[test]
fn stale_handle_of_removed_state_is_detached() {
    let store = store();
    let todos = store.scope().scope(todos());
    let first = todos.scope(Lens::element(1));
    let retain = first.retain().unwrap();
    todos.write(|t| t.clear()).unwrap();
    drop(retain);
    assert_eq!(first.node(), Err(Error::Detached(first.path().clone())));
    assert!(first.retain().is_err());
    assert!(first.events().is_err());
}

#[test]
fn cancellation_context_is_inherited_by_children() {
    let mut cr = CallRecorder::new();
    let store = store();
    let key = CancelKey::new("load");
    store.scope().with_cancellation_context(key.clone(), |root| {
        assert_eq!(root.cancellation_keys(), &[key.clone()]);
        root.register_cancellable(Cancellable::new(|| call!("root")))
            .unwrap();
        root.scope(count())
            .register_cancellable(Cancellable::new(|| call!("count")))
            .unwrap();
    });
    store
        .scope()
        .register_cancellable(Cancellable::new(|| call!("unrelated")))
        .unwrap();

    assert_eq!(store.cancel_all(&key), 2);
    cr.verify(["root", "count"]);
    assert_eq!(store.cancel_all(&key), 0);
    assert_eq!(store.pending_tasks(), 1);
    drop(store);
    cr.verify("unrelated");
}

#[test]
fn cancel_in_flight_replaces_the_pending_one() {
    let mut cr = CallRecorder::new();
    let store = store();
    let scope = store.scope().scope(count());
    let key = CancelKey::new("search");
    scope
        .register_cancellable_in_flight(key.clone(), Cancellable::new(|| call!("cancel 1")))
        .unwrap();
    cr.verify(());
    scope
        .register_cancellable_in_flight(key.clone(), Cancellable::new(|| call!("cancel 2")))
        .unwrap();
    cr.verify("cancel 1");
    assert_eq!(scope.pending_tasks(), 1);
    assert_eq!(scope.cancel_tasks(), 1);
    cr.verify("cancel 2");
}

#[test]
fn cancel_by_id() {
    let mut cr = CallRecorder::new();
    let store = store();
    let scope = store.scope();
    let id = scope
        .register_cancellable(Cancellable::new(|| call!("cancel")))
        .unwrap();
    assert!(scope.cancel(id));
    assert!(!scope.cancel(id));
    cr.verify("cancel");
}

#[derive(Debug, PartialEq)]
struct Saved(u32);

#[test]
fn events_are_routed_by_receivers() {
    let store = store();
    let root = store.scope();
    let todos = root.scope(todos());
    let first = todos.scope(Lens::element(1));
    let mut root_rx = root.events().unwrap();
    let mut todos_rx = todos.events().unwrap();
    let mut first_rx = first.events().unwrap();
    let received = |rx: &mut EventReceiver| -> Vec<u32> {
        rx.drain()
            .iter()
            .filter_map(|e| e.downcast_ref::<Saved>().map(|s| s.0))
            .collect()
    };

    first.send_event(Saved(1), Receivers::default()).unwrap();
    root.send_event(Saved(2), Receivers::CHILDREN).unwrap();
    root.send_event(Saved(3), Receivers::DESCENDANTS).unwrap();
    todos.send_event(Saved(4), Receivers::PARENT).unwrap();
    first.send_event(Saved(5), Receivers::SELF).unwrap();

    assert_eq!(received(&mut root_rx), vec![1, 4]);
    assert_eq!(received(&mut todos_rx), vec![1, 2, 3]);
    assert_eq!(received(&mut first_rx), vec![1, 3, 5]);
}

#[test]
fn event_carries_origin_and_batch() {
    let store = store();
    let first = store.scope().scope(todos()).scope(Lens::element(1));
    let mut rx = store.scope().events().unwrap();
    let context = CallContext::new(|f| f());
    first.with_call_context(context.clone(), |first| {
        first.send_event(Saved(1), Receivers::default()).unwrap()
    });
    let event = rx.try_recv().unwrap();
    assert_eq!(event.origin(), first.node().unwrap());
    assert_eq!(event.origin_path(), first.path());
    assert_eq!(event.batch().contexts(), &[context]);
}

#[test]
fn event_stream_ends_on_teardown() {
    let store = store();
    let first = store.scope().scope(todos()).scope(Lens::element(1));
    let retain = first.retain().unwrap();
    let mut rx = first.events().unwrap();
    first.send_event(Saved(1), Receivers::SELF).unwrap();
    drop(retain);
    let event = block_on(rx.next()).unwrap();
    assert!(event.is::<Saved>());
    assert!(block_on(rx.next()).is_none());
}

struct Counter {
    scope: Scope<u32>,
    initial: u32,
}

impl Model for Counter {
    type State = u32;

    fn build(cx: &BuildContext<u32>) -> Self {
        call!("build counter");
        Counter {
            scope: cx.scope().clone(),
            initial: cx.get(),
        }
    }
    fn on_activate(&self, scope: &Scope<u32>) {
        call!("activate counter at {}", scope.path());
    }
}

struct Dashboard {
    counter: Arc<Counter>,
    todo_count: usize,
}

impl Model for Dashboard {
    type State = App;

    fn build(cx: &BuildContext<App>) -> Self {
        call!("build dashboard");
        Dashboard {
            counter: cx.model(count()),
            todo_count: cx.read(&todos()).map_or(0, |t| t.len()),
        }
    }
}

#[test]
fn models_are_cached_per_token() {
    let mut cr = CallRecorder::new();
    let store = store();
    let count = store.scope().scope(count());
    let t1 = AccessToken::new();
    let t2 = AccessToken::new();

    let a = count.model::<Counter>(&t1);
    let b = count.model::<Counter>(&t1);
    cr.verify("build counter");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.initial, 0);

    let c = count.model::<Counter>(&t2);
    cr.verify("build counter");
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(count.model_count(), 2);

    drop(t2);
    assert_eq!(count.evict_stale_models(), 1);
    assert_eq!(count.model_count(), 1);
}

#[test]
fn model_writes_through_its_scope() {
    let _cr = CallRecorder::new();
    let store = store();
    let token = AccessToken::new();
    let counter = store.scope().scope(count()).model::<Counter>(&token);
    counter.scope.set(7).unwrap();
    assert_eq!(store.state().count, 7);
}

#[test]
fn child_models_share_the_token() {
    let mut cr = CallRecorder::new();
    let store = store();
    let token = AccessToken::new();
    let dashboard = store.scope().model::<Dashboard>(&token);
    cr.verify(["build dashboard", "build counter"]);
    assert_eq!(dashboard.todo_count, 2);

    let counter = store.scope().scope(count()).model::<Counter>(&token);
    cr.verify(());
    assert!(Arc::ptr_eq(&counter, &dashboard.counter));
}

#[test]
fn model_is_notified_on_activation() {
    let mut cr = CallRecorder::new();
    let store = store();
    let count = store.scope().scope(count());
    let token = AccessToken::new();
    let _model = count.model::<Counter>(&token);
    cr.verify("build counter");

    let retain = count.retain().unwrap();
    cr.verify("activate counter at count");
    drop(retain);
    cr.verify(());
}

struct Mutating;

impl Model for Mutating {
    type State = u32;

    fn build(cx: &BuildContext<u32>) -> Self {
        cx.scope().set(1).unwrap();
        Mutating
    }
}

#[test]
#[should_panic(expected = "mutated while a model was being built")]
fn mutating_during_build_panics() {
    let store = store();
    store
        .scope()
        .scope(count())
        .model::<Mutating>(&AccessToken::new());
}

#[test]
fn detached_scope_builds_an_uncached_model() {
    let mut cr = CallRecorder::new();
    let store = store();
    let first = store.scope().scope(todos()).scope(Lens::element(1));
    let retain = first.retain().unwrap();
    store.scope().scope(todos()).set(Vec::new()).unwrap();
    drop(retain);

    let count = first.scope(lens!(Todo, id));
    let token = AccessToken::new();
    let _ = count.model::<IdModel>(&token);
    let _ = count.model::<IdModel>(&token);
    cr.verify(["build id", "build id"]);
}

struct IdModel;

impl Model for IdModel {
    type State = u32;
    fn build(cx: &BuildContext<u32>) -> Self {
        call!("build id");
        let _ = cx.try_get();
        IdModel
    }
}
