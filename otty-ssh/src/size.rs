/// The size of the remote pseudo-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    /// The number of lines of text
    pub rows: u16,
    /// The number of columns of text
    pub cols: u16,
    /// The width of a cell in pixels.
    pub cell_width: u16,
    /// The height of a cell in pixels.
    pub cell_height: u16,
}

impl PtySize {
    /// Character geometry without pixel information.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            cell_width: 0,
            cell_height: 0,
        }
    }

    pub fn pixel_width(&self) -> u32 {
        u32::from(self.cols) * u32::from(self.cell_width)
    }

    pub fn pixel_height(&self) -> u32 {
        u32::from(self.rows) * u32::from(self.cell_height)
    }
}

impl Default for PtySize {
    fn default() -> Self {
        PtySize {
            rows: 30,
            cols: 80,
            cell_width: 0,
            cell_height: 0,
        }
    }
}
