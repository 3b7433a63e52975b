use std::{collections::HashMap, num::NonZeroUsize, task::Waker};

/// Identifies one future's entry in a [`WakerSet`]. Tokens can't be cloned,
/// which ties each one to the single future that registered it.
#[derive(Debug, Eq, PartialEq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn duplicate(&self) -> Token {
        Token(self.0)
    }
}

/// The wakers of every future waiting on one shared batch.
///
/// A batch only needs a single task to drive it forward: the "driving
/// waker", which is whichever waker most recently polled. The other futures
/// sleep until the batch completes and `wake_all` is called. If the driving
/// future goes away, `discard_and_wake` promotes and wakes another waker so
/// that the batch always has a path forward.
#[derive(Debug)]
pub(crate) struct WakerSet {
    wakers: HashMap<Token, Waker>,
    driving_waker: Option<Token>,

    // Batches are short lived; this can't realistically run out.
    next_token: NonZeroUsize,
}

impl Default for WakerSet {
    fn default() -> Self {
        Self {
            wakers: HashMap::with_capacity(1),
            driving_waker: None,
            next_token: NonZeroUsize::new(1).expect("1 is nonzero"),
        }
    }
}

impl WakerSet {
    /// Store the waker of a future that is being polled, making it the
    /// driving waker. If the future already has a token its waker is
    /// replaced; otherwise a new token is created and written into `slot`.
    pub(crate) fn register(&mut self, slot: &mut Option<Token>, waker: &Waker) {
        match slot {
            Some(token) => match self.wakers.get_mut(token) {
                Some(existing) if existing.will_wake(waker) => {}
                Some(existing) => existing.clone_from(waker),
                None => {
                    self.wakers.insert(token.duplicate(), waker.clone());
                }
            },
            None => {
                let token = Token(self.next_token);
                self.next_token = self
                    .next_token
                    .checked_add(1)
                    .expect("Overflow when creating token");

                self.wakers.insert(token.duplicate(), waker.clone());
                *slot = Some(token);
            }
        }

        self.driving_waker = slot.as_ref().map(Token::duplicate);
    }

    /// Remove a future's waker without waking anyone. Only appropriate when
    /// that future has its result and no longer needs the batch driven.
    pub(crate) fn discard(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker.as_ref() == Some(&token) {
            self.driving_waker = None;
        }
    }

    /// Remove a future's waker. If it was driving (or nobody was), another
    /// waker is promoted and woken so it can take over.
    pub(crate) fn discard_and_wake(&mut self, token: Token) {
        self.wakers.remove(&token);
        if self.driving_waker.as_ref() == Some(&token) {
            self.driving_waker = None;
        }

        if self.driving_waker.is_none() {
            self.wake_driver();
        }
    }

    /// Wake the driving waker, promoting an arbitrary waker first if there
    /// isn't one. Used when something outside the batch changed that the
    /// driver needs to react to.
    pub(crate) fn wake_driver(&mut self) {
        if self.driving_waker.is_none() {
            self.driving_waker = self.wakers.keys().next().map(Token::duplicate);
        }

        if let Some(waker) = self
            .driving_waker
            .as_ref()
            .and_then(|token| self.wakers.get(token))
        {
            waker.wake_by_ref();
        }
    }

    pub(crate) fn wake_all(self) {
        self.wakers
            .into_iter()
            .for_each(|(_token, waker)| waker.wake());
    }
}
