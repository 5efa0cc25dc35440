//! Composable addressing of sub-values.
//!
//! A [`Lens`] names a value inside a larger value. It always has a getter and optionally a
//! mutable accessor. Lenses carry an identity ([`LensId`]) so that scopes can memoize children
//! by the lens that reaches them.

use std::{
    any::Any,
    collections::BTreeMap,
    fmt::{self, Debug, Display},
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use derive_ex::Ex;

use crate::utils::AnyKey;


/// Values with a stable, application-supplied identity.
///
/// Collection elements are tracked by this identity, never by position.
pub trait Identified {
    type Id: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    fn id(&self) -> Self::Id;
}

/// Type-erased element identity used in a [`Segment::Key`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ElementKey(AnyKey);

impl ElementKey {
    pub fn new(id: impl Any + Send + Sync + Debug + Eq + Hash) -> Self {
        Self(AnyKey::new(id))
    }
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}
impl Debug for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

/// One step of a lens path.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Segment {
    Field(&'static str),
    /// A value that is read but not written: a read-only field or a computed value.
    Derived(&'static str),
    Key(ElementKey),
    Some,
    Token(u64),
}

impl Segment {
    /// A segment that is equal only to itself.
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Segment::Token(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(name) => f.write_str(name),
            Segment::Derived(name) => write!(f, "{name}()"),
            Segment::Key(key) => write!(f, "[{key:?}]"),
            Segment::Some => f.write_str("?"),
            Segment::Token(n) => write!(f, "#{n}"),
        }
    }
}

/// Identity of a lens: the path of segments it walks.
///
/// Composition concatenates paths, so `a.then(b).then(c)` and `a.then(b.then(c))` have the same
/// identity, and the identity lens has an empty path.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct LensId(Arc<[Segment]>);

impl LensId {
    pub fn root() -> Self {
        Self::default()
    }
    pub fn from_segments(segments: impl IntoIterator<Item = Segment>) -> Self {
        Self(segments.into_iter().collect())
    }
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn join(&self, other: &LensId) -> LensId {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        Self(self.0.iter().chain(other.0.iter()).cloned().collect())
    }
    pub fn starts_with(&self, prefix: &LensId) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl Display for LensId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (i, segment) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(".")?;
            }
            Display::fmt(segment, f)?;
        }
        Ok(())
    }
}
impl Debug for LensId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LensId({self})")
    }
}

type RefGetter<P, C> = Arc<dyn Fn(&P) -> Option<&C> + Send + Sync>;
type ComputedGetter<P, C> = Arc<dyn Fn(&P) -> Option<C> + Send + Sync>;
type MutGetter<P, C> = Arc<dyn Fn(&mut P) -> Option<&mut C> + Send + Sync>;

fn ref_getter<P, C>(
    f: impl Fn(&P) -> Option<&C> + Send + Sync + 'static,
) -> RefGetter<P, C> {
    Arc::new(f)
}
fn computed_getter<P, C>(f: impl Fn(&P) -> Option<C> + Send + Sync + 'static) -> ComputedGetter<P, C> {
    Arc::new(f)
}
fn mut_getter<P, C>(
    f: impl Fn(&mut P) -> Option<&mut C> + Send + Sync + 'static,
) -> MutGetter<P, C> {
    Arc::new(f)
}

enum Getter<P, C> {
    Ref(RefGetter<P, C>),
    Computed(ComputedGetter<P, C>),
}

impl<P, C> Clone for Getter<P, C> {
    fn clone(&self) -> Self {
        match self {
            Getter::Ref(f) => Getter::Ref(f.clone()),
            Getter::Computed(f) => Getter::Computed(f.clone()),
        }
    }
}

/// Getter and optional setter addressing a `C` inside a `P`.
#[derive(Ex)]
#[derive_ex(Clone(bound()))]
pub struct Lens<P, C> {
    id: LensId,
    get: Getter<P, C>,
    get_mut: Option<MutGetter<P, C>>,
}

impl<P: 'static> Lens<P, P> {
    /// The lens addressing the whole value.
    pub fn identity() -> Self {
        Self {
            id: LensId::root(),
            get: Getter::Ref(ref_getter(|p| Some(p))),
            get_mut: Some(mut_getter(|p| Some(p))),
        }
    }
}

impl<P: 'static, C: 'static> Lens<P, C> {
    /// A read-write lens to a field that always exists.
    pub fn field(
        name: &'static str,
        get: impl Fn(&P) -> &C + Send + Sync + 'static,
        get_mut: impl Fn(&mut P) -> &mut C + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: LensId::from_segments([Segment::Field(name)]),
            get: Getter::Ref(ref_getter(move |p| Some(get(p)))),
            get_mut: Some(mut_getter(move |p| Some(get_mut(p)))),
        }
    }

    /// A lens to a field that cannot be written through.
    pub fn read_only(name: &'static str, get: impl Fn(&P) -> &C + Send + Sync + 'static) -> Self {
        Self {
            id: LensId::from_segments([Segment::Derived(name)]),
            get: Getter::Ref(ref_getter(move |p| Some(get(p)))),
            get_mut: None,
        }
    }

    /// A read-only lens to a value derived from `P`.
    pub fn computed(name: &'static str, f: impl Fn(&P) -> C + Send + Sync + 'static) -> Self {
        Self {
            id: LensId::from_segments([Segment::Derived(name)]),
            get: Getter::Computed(computed_getter(move |p| Some(f(p)))),
            get_mut: None,
        }
    }

    /// A read-write lens to a value that may be absent.
    pub fn partial(
        segment: Segment,
        get: impl Fn(&P) -> Option<&C> + Send + Sync + 'static,
        get_mut: impl Fn(&mut P) -> Option<&mut C> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: LensId::from_segments([segment]),
            get: Getter::Ref(ref_getter(get)),
            get_mut: Some(mut_getter(get_mut)),
        }
    }

    pub fn id(&self) -> &LensId {
        &self.id
    }
    pub fn is_writable(&self) -> bool {
        self.get_mut.is_some()
    }

    /// Calls `f` with the addressed value, or `None` if it does not exist in `p`.
    pub fn with<R>(&self, p: &P, f: impl FnOnce(Option<&C>) -> R) -> R {
        match &self.get {
            Getter::Ref(get) => f(get(p)),
            Getter::Computed(get) => f(get(p).as_ref()),
        }
    }

    pub fn get(&self, p: &P) -> Option<C>
    where
        C: Clone,
    {
        match &self.get {
            Getter::Ref(get) => get(p).cloned(),
            Getter::Computed(get) => get(p),
        }
    }

    /// Mutable access, `None` if the lens is read-only or the value does not exist.
    pub fn get_mut<'a>(&self, p: &'a mut P) -> Option<&'a mut C> {
        self.get_mut.as_ref().and_then(|get_mut| get_mut(p))
    }

    /// Composes `self` with `next`, addressing `next`'s target inside `P`.
    pub fn then<D: Clone + 'static>(&self, next: &Lens<C, D>) -> Lens<P, D> {
        let get = match (&self.get, &next.get) {
            (Getter::Ref(f), Getter::Ref(g)) => {
                let (f, g) = (f.clone(), g.clone());
                Getter::Ref(ref_getter(move |p| f(p).and_then(|c| g(c))))
            }
            (Getter::Ref(f), Getter::Computed(g)) => {
                let (f, g) = (f.clone(), g.clone());
                Getter::Computed(computed_getter(move |p| f(p).and_then(|c| g(c))))
            }
            (Getter::Computed(f), Getter::Ref(g)) => {
                let (f, g) = (f.clone(), g.clone());
                Getter::Computed(computed_getter(move |p| {
                    f(p).and_then(|c| g(&c).cloned())
                }))
            }
            (Getter::Computed(f), Getter::Computed(g)) => {
                let (f, g) = (f.clone(), g.clone());
                Getter::Computed(computed_getter(move |p| f(p).and_then(|c| g(&c))))
            }
        };
        let get_mut = match (&self.get_mut, &next.get_mut) {
            (Some(f), Some(g)) => {
                let (f, g) = (f.clone(), g.clone());
                Some(mut_getter(move |p| f(p).and_then(|c| g(c))))
            }
            _ => None,
        };
        Lens {
            id: self.id.join(&next.id),
            get,
            get_mut,
        }
    }
}

impl<T: Identified + 'static> Lens<Vec<T>, T> {
    /// The element whose [`Identified::id`] is `id`, wherever it is in the vector.
    pub fn element(id: T::Id) -> Self {
        let id_mut = id.clone();
        Self::partial(
            Segment::Key(ElementKey::new(id.clone())),
            move |items| items.iter().find(|item| item.id() == id),
            move |items| items.iter_mut().find(|item| item.id() == id_mut),
        )
    }
}

impl<T: 'static> Lens<Option<T>, T> {
    /// The wrapped value of an `Option`.
    pub fn some() -> Self {
        Self::partial(Segment::Some, |o| o.as_ref(), |o| o.as_mut())
    }
}

impl<K, V> Lens<BTreeMap<K, V>, V>
where
    K: Ord + Clone + Eq + Hash + Debug + Send + Sync + 'static,
    V: 'static,
{
    /// The value stored under `key`.
    pub fn entry(key: K) -> Self {
        let key_mut = key.clone();
        Self::partial(
            Segment::Key(ElementKey::new(key.clone())),
            move |map| map.get(&key),
            move |map| map.get_mut(&key_mut),
        )
    }
}

impl<P, C> Debug for Lens<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lens")
            .field("id", &self.id)
            .field("writable", &self.get_mut.is_some())
            .finish()
    }
}

/// Creates a read-write [`Lens`] to a named field.
///
/// ```
/// # use statetree::lens;
/// #[derive(Clone)]
/// struct Counter {
///     count: u32,
/// }
/// let count = lens!(Counter, count);
/// assert_eq!(count.get(&Counter { count: 3 }), Some(3));
/// ```
#[macro_export]
macro_rules! lens {
    ($ty:ty, $field:ident) => {
        $crate::Lens::field(
            ::core::stringify!($field),
            |p: &$ty| &p.$field,
            |p: &mut $ty| &mut p.$field,
        )
    };
}
