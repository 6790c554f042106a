use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tetanes_core::input::JoypadBtnState;
use tetanes_core::mem::Read;
use tetanes_core::prelude::*;
use tracing::debug;

use crate::frame::RawFrame;
use crate::simulator::{ActionId, Simulator, SimulatorFactory};

pub const NES_WIDTH: usize = 256;
pub const NES_HEIGHT: usize = 240;

// =============================================================================
// Action Space
// =============================================================================

/// Joypad combinations a game profile can expose as actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NesAction {
    Noop,
    Right,
    Left,
    Up,
    Down,
    A,
    B,
    RightA,
    RightB,
    LeftA,
    LeftB,
    UpA,
    UpB,
    DownA,
    DownB,
}

impl NesAction {
    pub fn to_joypad(self) -> JoypadBtnState {
        use JoypadBtnState as Btn;
        match self {
            NesAction::Noop => Btn::empty(),
            NesAction::Right => Btn::RIGHT,
            NesAction::Left => Btn::LEFT,
            NesAction::Up => Btn::UP,
            NesAction::Down => Btn::DOWN,
            NesAction::A => Btn::A,
            NesAction::B => Btn::B,
            NesAction::RightA => Btn::RIGHT | Btn::A,
            NesAction::RightB => Btn::RIGHT | Btn::B,
            NesAction::LeftA => Btn::LEFT | Btn::A,
            NesAction::LeftB => Btn::LEFT | Btn::B,
            NesAction::UpA => Btn::UP | Btn::A,
            NesAction::UpB => Btn::UP | Btn::B,
            NesAction::DownA => Btn::DOWN | Btn::A,
            NesAction::DownB => Btn::DOWN | Btn::B,
        }
    }
}

// =============================================================================
// Game Profiles
// =============================================================================

/// RAM condition that marks the end of the title/countdown sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyCondition {
    pub mode_addr: u16,
    pub play_mode: u8,
    /// Counts down to 0 before player input is accepted.
    pub start_timer_addr: u16,
    pub max_wait_frames: u32,
}

/// Where a game keeps lives and score, and which joypad combos it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameProfile {
    pub name: String,
    pub actions: Vec<NesAction>,
    pub lives_addr: Option<u16>,
    /// BCD digits, most significant first; empty means no score reward.
    pub score_digits: Vec<u16>,
    /// Larger jumps are RAM glitches (title screen, demo), not points.
    pub max_score_delta: u32,
    pub boot_frames: u32,
    pub start_press_frames: u32,
    pub ready: Option<ReadyCondition>,
}

impl GameProfile {
    /// Kung Fu (Spartan X).
    pub fn kung_fu() -> Self {
        use NesAction::*;
        Self {
            name: "kung-fu".into(),
            // Down crouches, Up jumps, B punches, A kicks.
            actions: vec![
                Noop, Right, Left, Down, Up, RightB, RightA, LeftB, LeftA, DownB, DownA, UpB, UpA,
            ],
            lives_addr: Some(0x005C),
            score_digits: vec![0x0531, 0x0532, 0x0533, 0x0534, 0x0535, 0x0536],
            max_score_delta: 5_000,
            boot_frames: 120,
            start_press_frames: 2,
            ready: Some(ReadyCondition {
                mode_addr: 0x0062,
                play_mode: 0x02,
                start_timer_addr: 0x003A,
                max_wait_frames: 600,
            }),
        }
    }

    /// Any mapper-0 game: full joypad set, no lives or score tracking.
    pub fn generic() -> Self {
        use NesAction::*;
        Self {
            name: "generic".into(),
            actions: vec![Noop, A, B, Right, Left, Up, Down, RightA, LeftA],
            lives_addr: None,
            score_digits: Vec::new(),
            max_score_delta: u32::MAX,
            boot_frames: 60,
            start_press_frames: 2,
            ready: None,
        }
    }

    pub fn by_name(name: &str) -> Result<Self> {
        match name {
            "kung-fu" | "kungfu" => Ok(Self::kung_fu()),
            "generic" => Ok(Self::generic()),
            other => bail!("unknown game profile `{other}` (expected kung-fu or generic)"),
        }
    }
}

// =============================================================================
// NES Simulator
// =============================================================================

pub struct NesSimulator {
    deck: ControlDeck,
    profile: GameProfile,
    action_ids: Vec<ActionId>,
    seed: u64,
    last_score: u32,
    last_lives: u32,
    game_over: bool,
}

impl NesSimulator {
    pub fn new(rom_path: &Path, profile: GameProfile, seed: u64) -> Result<Self> {
        if profile.actions.first() != Some(&NesAction::Noop) {
            bail!("profile `{}` must list Noop as its first action", profile.name);
        }
        let mut deck = ControlDeck::new();
        // Video stays on: the agent learns from pixels.
        deck.set_headless_mode(tetanes_core::control_deck::HeadlessMode::NO_AUDIO);
        deck.load_rom_path(rom_path)
            .with_context(|| format!("Failed to load ROM: {}", rom_path.display()))?;
        let action_ids = (0..profile.actions.len()).collect();
        Ok(Self {
            deck,
            profile,
            action_ids,
            seed,
            last_score: 0,
            last_lives: 0,
            game_over: false,
        })
    }

    pub fn profile(&self) -> &GameProfile {
        &self.profile
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn peek(&self, addr: u16) -> u8 {
        self.deck.bus().peek(addr)
    }

    fn read_score(&self) -> u32 {
        self.profile
            .score_digits
            .iter()
            .fold(0u32, |acc, &addr| acc * 10 + (self.peek(addr) & 0x0F) as u32)
    }

    fn read_lives(&self) -> u32 {
        self.profile
            .lives_addr
            .map(|addr| self.peek(addr) as u32)
            .unwrap_or(0)
    }

    fn set_input_state(&mut self, btn_state: JoypadBtnState) {
        let joypad = self.deck.joypad_mut(Player::One);
        for button in [
            JoypadBtnState::LEFT,
            JoypadBtnState::RIGHT,
            JoypadBtnState::UP,
            JoypadBtnState::DOWN,
            JoypadBtnState::A,
            JoypadBtnState::B,
            JoypadBtnState::TURBO_A,
            JoypadBtnState::TURBO_B,
            JoypadBtnState::START,
            JoypadBtnState::SELECT,
        ] {
            joypad.set_button(button, btn_state.contains(button));
        }
    }

    fn clock_frames(&mut self, frames: u32) -> Result<()> {
        for _ in 0..frames {
            self.deck.clock_frame()?;
        }
        Ok(())
    }

    fn press_start(&mut self, frames: u32) -> Result<()> {
        self.set_input_state(JoypadBtnState::START);
        self.clock_frames(frames)?;
        self.set_input_state(JoypadBtnState::empty());
        Ok(())
    }

    fn wait_until_ready(&mut self, ready: &ReadyCondition) -> Result<()> {
        let mut frames = 0u32;
        loop {
            let mode = self.peek(ready.mode_addr);
            let timer = self.peek(ready.start_timer_addr);
            if mode == ready.play_mode && timer == 0 {
                debug!(frames, "play state reached");
                return Ok(());
            }
            if frames >= ready.max_wait_frames {
                bail!(
                    "Timed out waiting for play state (mode: 0x{mode:02X}, start_timer: {timer})"
                );
            }
            self.deck.clock_frame()?;
            frames += 1;
        }
    }
}

impl Simulator for NesSimulator {
    fn legal_actions(&self) -> &[ActionId] {
        &self.action_ids
    }

    fn screen_dims(&self) -> (usize, usize) {
        (NES_WIDTH, NES_HEIGHT)
    }

    fn act(&mut self, action: ActionId) -> Result<f64> {
        let nes_action = *self
            .profile
            .actions
            .get(action)
            .with_context(|| format!("action {action} outside the legal set"))?;
        self.set_input_state(nes_action.to_joypad());
        self.deck.clock_frame()?;

        let score = self.read_score();
        let delta = score.saturating_sub(self.last_score);
        self.last_score = score;
        let reward = if delta < self.profile.max_score_delta {
            delta as f64
        } else {
            0.0
        };

        let lives = self.read_lives();
        if self.profile.lives_addr.is_some() && lives < self.last_lives && lives == 0 {
            self.game_over = true;
        }
        self.last_lives = lives;
        Ok(reward)
    }

    fn capture_grayscale(&mut self, frame: &mut RawFrame) -> Result<()> {
        let fb = self.deck.frame_buffer();
        if fb.len() < NES_WIDTH * NES_HEIGHT * 4 {
            bail!("frame buffer too small: {} bytes", fb.len());
        }
        // BT.601 luma in integer arithmetic.
        for (dst, src) in frame.pixels_mut().iter_mut().zip(fb.chunks_exact(4)) {
            let luma = 299 * src[0] as u32 + 587 * src[1] as u32 + 114 * src[2] as u32;
            *dst = (luma / 1000) as u8;
        }
        Ok(())
    }

    fn lives(&self) -> u32 {
        self.last_lives
    }

    fn is_game_over(&self) -> bool {
        self.game_over
    }

    fn reset_episode(&mut self) -> Result<()> {
        self.deck.reset(ResetKind::Soft);
        self.set_input_state(JoypadBtnState::empty());
        self.clock_frames(self.profile.boot_frames)?;
        self.press_start(self.profile.start_press_frames)?;
        if let Some(ready) = self.profile.ready.clone() {
            self.wait_until_ready(&ready)?;
        }
        self.last_score = self.read_score();
        self.last_lives = self.read_lives();
        self.game_over = false;
        Ok(())
    }
}

/// Builds NES simulators for one ROM and profile.
#[derive(Debug, Clone)]
pub struct NesFactory {
    pub rom: PathBuf,
    pub profile: GameProfile,
}

impl NesFactory {
    pub fn new(rom: PathBuf, profile: GameProfile) -> Self {
        Self { rom, profile }
    }
}

impl SimulatorFactory for NesFactory {
    type Sim = NesSimulator;

    fn action_count(&self) -> usize {
        self.profile.actions.len()
    }

    fn construct(&self, seed: u64) -> Result<NesSimulator> {
        NesSimulator::new(&self.rom, self.profile.clone(), seed)
    }
}
