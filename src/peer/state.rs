use std::sync::Mutex;

/// Состояние согласования звонка.
///
/// `idle → local-description-set → remote-description-pending → connected → closed`.
/// `Connected` выставляется по сигналу состояния соединения, `Closed` только
/// при завершении сессии и достижим из любого состояния.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    Idle,
    /// Локальное описание применено к соединению
    LocalDescriptionSet,
    /// Локальное описание опубликовано в комнате, ждём вторую сторону.
    /// У ответчика offer к этому моменту уже применён: answer опубликован, ждём собеседника.
    RemoteDescriptionPending,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn can_advance_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (from, to) => to > from,
        }
    }
}

/// Ячейка состояния одной сессии
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<NegotiationState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: Mutex::new(NegotiationState::Idle),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> NegotiationState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Переход вперёд; возвращает false, если переход недопустим
    pub fn advance(&self, next: NegotiationState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.can_advance_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }
}
