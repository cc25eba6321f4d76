//! See [`Seq`].

use std::{
    cmp::Ordering,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// Sequence number uniquely identifying an item sent across a network.
///
/// The number may identify either a message or a packet sequence number.
///
/// The number is stored internally as a [`u16`], which means it will wrap
/// around fairly quickly as many items can be sent per second. Users of a
/// sequence number should take this into account, and use [`Seq::after`]
/// and [`Seq::before`], which take wraparound into consideration.
///
/// # Wraparound
///
/// Operations on [`Seq`] must take into account wraparound, as it is
/// inevitable that it will eventually occur in the program - a [`u16`] is
/// relatively very small.
///
/// The sequence number can be visualized as an infinite number line, where
/// [`u16::MAX`] is right before `0`, `0` is before `1`, etc.:
///
/// ```text
///     65534  65535    0      1      2
/// ... --|------|------|------|------|-- ...
/// ```
///
/// [Addition](std::ops::Add) and [subtraction](std::ops::Sub) will always
/// wrap.
///
/// See <https://gafferongames.com/post/reliability_ordering_and_congestion_avoidance_over_udp/>,
/// *Handling Sequence Number Wrap-Around*.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Seq(pub u16);

impl Seq {
    /// Sequence number with value [`u16::MAX`].
    pub const MAX: Seq = Seq(u16::MAX);

    /// Logically compares `self` to `other` in a way that respects
    /// wrap-around of sequence numbers.
    ///
    /// If the two sequence numbers are close together, the comparison is as
    /// normal; if they are far apart, they are assumed to have wrapped
    /// around. Thus `Seq(1).after(Seq(0))` is `true`, and so is
    /// `Seq(0).after(Seq::MAX)`.
    ///
    /// If the two values compared have a real difference equal to or larger
    /// than `u16::MAX / 2`, no guarantees are upheld.
    ///
    /// # Example
    ///
    /// ```
    /// # use lanewire_proto::seq::Seq;
    /// assert!(Seq(1).after(Seq(0)));
    /// assert!(Seq(0).after(Seq::MAX));
    /// assert!(!Seq(0).after(Seq(0)));
    /// ```
    #[must_use]
    pub const fn after(self, other: Seq) -> bool {
        let (s1, s2) = (self.0, other.0);
        ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
    }

    /// Mirror of [`Seq::after`]: `a.before(b)` iff `b.after(a)`.
    #[must_use]
    pub const fn before(self, other: Seq) -> bool {
        other.after(self)
    }

    /// Gets a signed number for the value of sequences "elapsed" between
    /// `rhs` and `self`.
    ///
    /// This is effectively `rhs - self`, but taking into account wraparound
    /// and therefore returning a signed value. This will always return the
    /// smallest path around this "circle".
    ///
    /// # Example
    ///
    /// ```
    /// # use lanewire_proto::seq::Seq;
    /// assert_eq!(Seq(0).dist_to(Seq(5)), 5);
    /// assert_eq!(Seq(2).dist_to(Seq(0)), -2);
    /// assert_eq!(Seq::MAX.dist_to(Seq(0)), 1);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        #[allow(clippy::cast_possible_wrap)] // that's exactly what we want
        (rhs.0.wrapping_sub(self.0) as i16)
    }
}

impl Ord for Seq {
    /// See [`Seq::after`].
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        } else if self.after(*other) {
            Ordering::Greater
        } else {
            Ordering::Less
        }
    }
}

impl PartialOrd for Seq {
    /// See [`Seq::cmp`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add<Seq> for Seq {
    type Output = Seq;

    fn add(self, rhs: Seq) -> Self::Output {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Seq {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub<Seq> for Seq {
    type Output = Seq;

    fn sub(self, rhs: Seq) -> Self::Output {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Seq {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
