//! Registry, matcher and reservation scheduler
//!
//! All hub state lives behind one lock; a scheduler pass is the only place
//! that moves reservations between states, so the §-invariants (one
//! allocation per place, FIFO fairness, non-empty candidate sets) hold by
//! construction. Notifications are collected during a pass and delivered
//! after the lock is released.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

use protocol::messages::{
    HubNotification, PlaceAvailable, PlaceReserved, PlaceReturned, ReservationLost,
};
use protocol::types::{ExportDesc, ImportSpec, Place, ReturnReason};
use protocol::ErrorObject;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::Role;

pub type PlaceId = u64;
pub type ReservationId = u64;
pub type SessionId = u64;

/// How many returned reservations are kept for inspection.
const RETURNED_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Pending,
    Allocated,
    Returned,
}

struct PlaceEntry {
    place: Place,
    session: SessionId,
    allocated: Option<ReservationId>,
}

struct ReservationEntry {
    id: ReservationId,
    session: SessionId,
    peer_ip: IpAddr,
    spec: ImportSpec,
    state: ReservationState,
    /// Candidate places in registration order.
    candidates: Vec<PlaceId>,
    /// Chosen part assignment per candidate: import part name -> index
    /// into the place's part list.
    assignments: HashMap<PlaceId, BTreeMap<String, usize>>,
    place: Option<PlaceId>,
    // Lifecycle record; kept on the entry for inspection even though the
    // scheduler itself never reads it back.
    #[allow(dead_code)]
    token: Option<String>,
    #[allow(dead_code)]
    reason: Option<ReturnReason>,
    #[allow(dead_code)]
    created_at: Instant,
    #[allow(dead_code)]
    allocated_at: Option<Instant>,
    #[allow(dead_code)]
    returned_at: Option<Instant>,
}

struct SessionEntry {
    peer_ip: IpAddr,
    roles: HashSet<Role>,
    notifier: mpsc::Sender<HubNotification>,
    /// Place registered by this session, if it is an exporter.
    place: Option<PlaceId>,
    /// Reservations owned by this session, if it is an agent.
    reservations: HashSet<ReservationId>,
}

#[derive(Default)]
struct HubState {
    next_place_id: PlaceId,
    next_reservation_id: ReservationId,
    next_session_id: SessionId,
    places: BTreeMap<PlaceId, PlaceEntry>,
    reservations: BTreeMap<ReservationId, ReservationEntry>,
    /// Pending reservations in insertion order.
    pending: VecDeque<ReservationId>,
    sessions: HashMap<SessionId, SessionEntry>,
    returned_log: VecDeque<ReservationId>,
}

type Notes = Vec<(mpsc::Sender<HubNotification>, HubNotification)>;

/// The hub's canonical state. One instance per process; tests create their
/// own.
pub struct Hub {
    state: Mutex<HubState>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState::default()),
        }
    }

    /// Register a control channel. Pushed notifications for the session
    /// arrive on the returned receiver's counterpart.
    pub fn session_opened(
        &self,
        peer_ip: IpAddr,
        roles: HashSet<Role>,
        notifier: mpsc::Sender<HubNotification>,
    ) -> SessionId {
        let mut state = self.lock();
        state.next_session_id += 1;
        let id = state.next_session_id;
        state.sessions.insert(
            id,
            SessionEntry {
                peer_ip,
                roles,
                notifier,
                place: None,
                reservations: HashSet::new(),
            },
        );
        debug!("session {id} opened from {peer_ip}");
        id
    }

    /// Tear down a session: an exporter's places disappear and their
    /// allocations are force-returned, an agent's reservations are
    /// returned.
    pub async fn session_closed(&self, session_id: SessionId) {
        let notes = {
            let mut state = self.lock();
            let Some(session) = state.sessions.remove(&session_id) else {
                return;
            };
            let mut notes = Notes::new();

            if let Some(place_id) = session.place {
                Self::drop_place(&mut state, place_id, &mut notes);
            }

            for reservation_id in session.reservations {
                Self::do_return(&mut state, reservation_id, ReturnReason::AgentGone, &mut notes);
            }

            Self::run_pass(&mut state, &mut notes);
            debug!("session {session_id} closed");
            notes
        };
        Self::deliver(notes).await;
    }

    pub async fn register_exporter(
        &self,
        session_id: SessionId,
        desc: ExportDesc,
    ) -> Result<PlaceId, ErrorObject> {
        desc.validate()
            .map_err(|e| ErrorObject::invalid_params(e.to_string()))?;

        let (place_id, notes) = {
            let mut state = self.lock();
            let session = Self::require_role(&state, session_id, Role::Exporter)?;
            if session.place.is_some() {
                return Err(ErrorObject::invalid_params("place already registered"));
            }
            let host = session.peer_ip.to_string();

            state.next_place_id += 1;
            let place_id = state.next_place_id;
            let place = Place::new(place_id, host, desc);

            // A new place may extend the candidate set of pending
            // reservations.
            let mut extended = Vec::new();
            for entry in state.reservations.values_mut() {
                if entry.state != ReservationState::Pending {
                    continue;
                }
                if let Some(assignment) = crate::matcher::find_assignment(&entry.spec, &place) {
                    entry.candidates.push(place_id);
                    entry.assignments.insert(place_id, assignment);
                    extended.push(entry.id);
                }
            }
            if !extended.is_empty() {
                debug!("place {place_id} extends candidates of {extended:?}");
            }

            state.places.insert(
                place_id,
                PlaceEntry {
                    place,
                    session: session_id,
                    allocated: None,
                },
            );
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.place = Some(place_id);
            }
            info!("new place registered: {place_id}");

            let mut notes = Notes::new();
            Self::run_pass(&mut state, &mut notes);
            (place_id, notes)
        };

        Self::deliver(notes).await;
        Ok(place_id)
    }

    pub async fn reserve(
        &self,
        session_id: SessionId,
        spec: ImportSpec,
    ) -> Result<ReservationId, ErrorObject> {
        spec.validate()
            .map_err(|e| ErrorObject::invalid_params(e.to_string()))?;

        let (reservation_id, notes) = {
            let mut state = self.lock();
            let session = Self::require_role(&state, session_id, Role::Importer)?;
            let peer_ip = session.peer_ip;

            let mut candidates = Vec::new();
            let mut assignments = HashMap::new();
            for (place_id, entry) in &state.places {
                if let Some(assignment) = crate::matcher::find_assignment(&spec, &entry.place) {
                    candidates.push(*place_id);
                    assignments.insert(*place_id, assignment);
                }
            }
            if candidates.is_empty() {
                return Err(ErrorObject::no_match("no matching place found"));
            }

            state.next_reservation_id += 1;
            let reservation_id = state.next_reservation_id;
            state.reservations.insert(
                reservation_id,
                ReservationEntry {
                    id: reservation_id,
                    session: session_id,
                    peer_ip,
                    spec,
                    state: ReservationState::Pending,
                    candidates,
                    assignments,
                    place: None,
                    token: None,
                    reason: None,
                    created_at: Instant::now(),
                    allocated_at: None,
                    returned_at: None,
                },
            );
            state.pending.push_back(reservation_id);
            if let Some(session) = state.sessions.get_mut(&session_id) {
                session.reservations.insert(reservation_id);
            }
            info!("reservation {reservation_id} enqueued");

            let mut notes = Notes::new();
            Self::run_pass(&mut state, &mut notes);
            (reservation_id, notes)
        };

        Self::deliver(notes).await;
        Ok(reservation_id)
    }

    /// Idempotent: returning an unknown or already-returned reservation is
    /// a no-op.
    pub async fn return_reservation(
        &self,
        session_id: SessionId,
        reservation_id: ReservationId,
    ) -> Result<(), ErrorObject> {
        let notes = {
            let mut state = self.lock();
            Self::require_role(&state, session_id, Role::Importer)?;

            match state.reservations.get(&reservation_id) {
                None => {
                    info!("reservation {reservation_id} returned, but it doesn't exist");
                    return Ok(());
                }
                Some(entry) if entry.state == ReservationState::Returned => return Ok(()),
                Some(entry) if entry.session != session_id => {
                    return Err(ErrorObject::invalid_params(
                        "reservation is owned by another session",
                    ));
                }
                Some(_) => {}
            }

            let mut notes = Notes::new();
            Self::do_return(&mut state, reservation_id, ReturnReason::Returned, &mut notes);
            Self::run_pass(&mut state, &mut notes);
            notes
        };
        Self::deliver(notes).await;
        Ok(())
    }

    /// Registered places, for the HTTP API and the status page.
    pub fn places(&self) -> Vec<Place> {
        let state = self.lock();
        state.places.values().map(|e| e.place.clone()).collect()
    }

    /// State of one reservation, if the hub still knows it.
    pub fn reservation_state(&self, id: ReservationId) -> Option<ReservationState> {
        let state = self.lock();
        state.reservations.get(&id).map(|e| e.state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().expect("hub state lock poisoned")
    }

    fn require_role<'a>(
        state: &'a std::sync::MutexGuard<'_, HubState>,
        session_id: SessionId,
        role: Role,
    ) -> Result<&'a SessionEntry, ErrorObject> {
        let session = state
            .sessions
            .get(&session_id)
            .ok_or_else(|| ErrorObject::internal("unknown session"))?;
        if !session.roles.contains(&role) {
            return Err(ErrorObject::auth(format!(
                "permission denied: requires role {:?}",
                role.name()
            )));
        }
        Ok(session)
    }

    /// One scheduler pass: walk the pending queue in insertion order and
    /// give each reservation the first free place of its candidate list.
    fn run_pass(state: &mut HubState, notes: &mut Notes) {
        let queue: Vec<ReservationId> = state.pending.iter().copied().collect();
        for reservation_id in queue {
            let Some(entry) = state.reservations.get(&reservation_id) else {
                continue;
            };
            if entry.state != ReservationState::Pending {
                continue;
            }
            let chosen = entry
                .candidates
                .iter()
                .copied()
                .find(|id| matches!(state.places.get(id), Some(p) if p.allocated.is_none()));
            if let Some(place_id) = chosen {
                Self::allocate(state, reservation_id, place_id, notes);
            }
        }
    }

    fn allocate(
        state: &mut HubState,
        reservation_id: ReservationId,
        place_id: PlaceId,
        notes: &mut Notes,
    ) {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        let Some(entry) = state.reservations.get_mut(&reservation_id) else {
            return;
        };
        entry.state = ReservationState::Allocated;
        entry.place = Some(place_id);
        entry.token = Some(token.clone());
        entry.allocated_at = Some(Instant::now());
        let agent_session = entry.session;
        let peer_ip = entry.peer_ip;
        let assignment = entry.assignments.get(&place_id).cloned().unwrap_or_default();

        state.pending.retain(|&id| id != reservation_id);

        let place_entry = state
            .places
            .get_mut(&place_id)
            .expect("allocated place must exist");
        place_entry.allocated = Some(reservation_id);
        let place = place_entry.place.clone();
        let exporter_session = place_entry.session;

        info!("place {place_id} allocated to reservation {reservation_id}");

        let parts: BTreeMap<String, _> = assignment
            .iter()
            .filter_map(|(name, &idx)| {
                place.parts.get(idx).map(|part| (name.clone(), part.clone()))
            })
            .collect();

        if let Some(session) = state.sessions.get(&exporter_session) {
            notes.push((
                session.notifier.clone(),
                HubNotification::PlaceReserved(PlaceReserved {
                    place_id,
                    peer_ip,
                    token: token.clone(),
                }),
            ));
        }
        if let Some(session) = state.sessions.get(&agent_session) {
            notes.push((
                session.notifier.clone(),
                HubNotification::PlaceAvailable(PlaceAvailable {
                    reservation_id,
                    place_id,
                    host: place.host.clone(),
                    port: place.port,
                    parts,
                    token,
                }),
            ));
        }
    }

    /// Move a reservation to Returned, freeing its place and informing the
    /// parties that are still connected.
    fn do_return(
        state: &mut HubState,
        reservation_id: ReservationId,
        reason: ReturnReason,
        notes: &mut Notes,
    ) {
        let Some(entry) = state.reservations.get_mut(&reservation_id) else {
            return;
        };
        if entry.state == ReservationState::Returned {
            return;
        }

        let previous = entry.state;
        entry.state = ReservationState::Returned;
        entry.reason = Some(reason);
        entry.returned_at = Some(Instant::now());
        let agent_session = entry.session;
        let place_id = entry.place;

        state.pending.retain(|&id| id != reservation_id);
        info!("reservation {reservation_id} returned ({reason})");

        if previous == ReservationState::Allocated {
            if let Some(place_id) = place_id {
                if let Some(place_entry) = state.places.get_mut(&place_id) {
                    place_entry.allocated = None;
                    if let Some(session) = state.sessions.get(&place_entry.session) {
                        notes.push((
                            session.notifier.clone(),
                            HubNotification::PlaceReturned(PlaceReturned { place_id }),
                        ));
                    }
                }
            }
        }

        // The owner initiated a plain return itself; everything else is a
        // forced return it has to learn about.
        if reason != ReturnReason::Returned && reason != ReturnReason::AgentGone {
            if let Some(session) = state.sessions.get(&agent_session) {
                notes.push((
                    session.notifier.clone(),
                    HubNotification::ReservationLost(ReservationLost {
                        reservation_id,
                        reason,
                    }),
                ));
            }
        }

        if let Some(session) = state.sessions.get_mut(&agent_session) {
            session.reservations.remove(&reservation_id);
        }

        state.returned_log.push_back(reservation_id);
        while state.returned_log.len() > RETURNED_HISTORY {
            if let Some(old) = state.returned_log.pop_front() {
                if matches!(
                    state.reservations.get(&old),
                    Some(e) if e.state == ReservationState::Returned
                ) {
                    state.reservations.remove(&old);
                }
            }
        }
    }

    /// Remove a place whose exporter session ended: its allocation is
    /// force-returned and pending reservations lose it as a candidate.
    fn drop_place(state: &mut HubState, place_id: PlaceId, notes: &mut Notes) {
        let Some(place_entry) = state.places.remove(&place_id) else {
            return;
        };
        info!("place disappeared: {place_id}");

        if let Some(reservation_id) = place_entry.allocated {
            Self::do_return(state, reservation_id, ReturnReason::ExporterGone, notes);
        }

        let mut orphaned = Vec::new();
        for entry in state.reservations.values_mut() {
            if entry.state != ReservationState::Pending {
                continue;
            }
            entry.candidates.retain(|&id| id != place_id);
            entry.assignments.remove(&place_id);
            if entry.candidates.is_empty() {
                orphaned.push(entry.id);
            }
        }
        for reservation_id in orphaned {
            Self::do_return(state, reservation_id, ReturnReason::CandidatesGone, notes);
        }
    }

    async fn deliver(notes: Notes) {
        for (notifier, note) in notes {
            if notifier.send(note).await.is_err() {
                warn!("dropping notification for closed session");
            }
        }
    }
}
